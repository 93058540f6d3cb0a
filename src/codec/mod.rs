//! Wire codec: frame encode/decode over a byte stream.
//!
//! `FrameCodec` plugs into `tokio_util::codec::Framed` and owns the
//! streaming reassembly state: the header prefix is parsed as soon as
//! 13 bytes are buffered, the optional length words follow, and the
//! body is not pulled out of the read buffer until every byte of it
//! has arrived. Oversize frames are rejected from the length fields
//! alone, before any body buffering. Trailing bytes stay in the buffer
//! for the next frame.

mod secure;

pub use secure::FrameKey;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::TetherError;
use crate::frame::{
    CompressionAlgo, EncryptionAlgo, Frame, FrameFlags, FrameHeader, FIXED_PREFIX_LEN,
};
use crate::metadata::KvMap;

/// Default cap on the total on-wire body of one frame: 64 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// ── Reassembly state ─────────────────────────────────────────────

/// Where the decoder stands in the current frame. The parsed header is
/// carried between polls so each prefix is validated exactly once.
#[derive(Debug)]
enum RecvState {
    AwaitHeader,
    AwaitBodyLengths(FrameHeader),
    AwaitBody(FrameHeader),
}

// ── FrameCodec ───────────────────────────────────────────────────

/// Encoder/decoder for tether frames.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    key: Option<FrameKey>,
    state: RecvState,
}

impl FrameCodec {
    /// Create a codec with the given frame-size cap and optional
    /// pre-derived encryption key.
    pub fn new(max_frame_bytes: usize, key: Option<FrameKey>) -> Self {
        Self {
            max_frame_bytes,
            key,
            state: RecvState::AwaitHeader,
        }
    }

    // ── Decode helpers ───────────────────────────────────────────

    /// Split the restored wire body into sections and reverse the
    /// transforms per section.
    fn decode_body(&self, header: &FrameHeader, body: &[u8]) -> Result<Frame, TetherError> {
        let compressed = header.flags.contains(FrameFlags::COMPRESSED);
        let encrypted = header.flags.contains(FrameFlags::ENCRYPTED);
        if compressed != (header.compression != CompressionAlgo::None) {
            return Err(TetherError::MalformedFrame(
                "compression flag disagrees with algorithm tag",
            ));
        }
        if encrypted != (header.encryption != EncryptionAlgo::None) {
            return Err(TetherError::MalformedFrame(
                "encryption flag disagrees with algorithm tag",
            ));
        }

        let payload_end = header.payload_len as usize;
        let metadata_end = payload_end + header.metadata_len as usize;
        let extra_end = metadata_end + header.extra_len as usize;
        debug_assert_eq!(extra_end, body.len());

        let restore = |section: &[u8]| {
            secure::reverse(
                header.compression,
                header.encryption,
                self.key.as_ref(),
                section,
            )
        };

        let payload = restore(&body[..payload_end])?;
        let metadata = if header.flags.contains(FrameFlags::HAS_METADATA) {
            KvMap::from_wire(&restore(&body[payload_end..metadata_end])?)?
        } else {
            KvMap::new()
        };
        let extra = if header.flags.contains(FrameFlags::HAS_EXTRA) {
            KvMap::from_wire(&restore(&body[metadata_end..extra_end])?)?
        } else {
            KvMap::new()
        };

        Ok(Frame::new(
            header.msg_type,
            payload,
            metadata,
            extra,
            header.compression,
            header.encryption,
        ))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TetherError> {
        loop {
            match self.state {
                RecvState::AwaitHeader => {
                    if src.len() < FIXED_PREFIX_LEN {
                        return Ok(None);
                    }
                    let header = FrameHeader::parse_prefix(&src[..FIXED_PREFIX_LEN])?;
                    // reject from the length field alone, before the
                    // body ever gets buffered
                    if header.payload_len as usize > self.max_frame_bytes {
                        return Err(TetherError::MalformedFrame("frame exceeds maximum size"));
                    }
                    src.advance(FIXED_PREFIX_LEN);
                    self.state = RecvState::AwaitBodyLengths(header);
                }
                RecvState::AwaitBodyLengths(mut header) => {
                    let need = header.extra_length_words() * 4;
                    if src.len() < need {
                        return Ok(None);
                    }
                    header.read_body_lengths(&src[..need]);
                    src.advance(need);
                    if header.total_body_len() > self.max_frame_bytes {
                        return Err(TetherError::MalformedFrame("frame exceeds maximum size"));
                    }
                    self.state = RecvState::AwaitBody(header);
                }
                RecvState::AwaitBody(header) => {
                    let total = header.total_body_len();
                    if src.len() < total {
                        src.reserve(total - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(total);
                    self.state = RecvState::AwaitHeader;
                    return Ok(Some(self.decode_body(&header, &body)?));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TetherError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if src.is_empty() && matches!(self.state, RecvState::AwaitHeader) {
                    Ok(None) // clean FIN at a frame boundary
                } else {
                    Err(TetherError::UnexpectedEof)
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TetherError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TetherError> {
        let compression = frame.compression();
        let mut encryption = frame.encryption();
        if encryption != EncryptionAlgo::None && self.key.is_none() {
            // observed source behavior, preserved: warn and downgrade
            warn!("encryption requested but no passphrase is configured; sending unencrypted");
            encryption = EncryptionAlgo::None;
        }

        let seal = |section: &[u8]| secure::apply(compression, encryption, self.key.as_ref(), section);

        let payload = seal(frame.payload())?;
        let metadata = if frame.metadata().is_empty() {
            None
        } else {
            Some(seal(&frame.metadata().to_wire())?)
        };
        let extra = if frame.extra().is_empty() {
            None
        } else {
            Some(seal(&frame.extra().to_wire())?)
        };

        let mut flags = FrameFlags::default();
        if metadata.is_some() {
            flags.set(FrameFlags::HAS_METADATA);
        }
        if extra.is_some() {
            flags.set(FrameFlags::HAS_EXTRA);
        }
        if compression != CompressionAlgo::None {
            flags.set(FrameFlags::COMPRESSED);
        }
        if encryption != EncryptionAlgo::None {
            flags.set(FrameFlags::ENCRYPTED);
        }

        let header = FrameHeader {
            msg_type: frame.msg_type(),
            flags,
            compression,
            encryption,
            payload_len: payload.len() as u32,
            metadata_len: metadata.as_ref().map_or(0, |m| m.len() as u32),
            extra_len: extra.as_ref().map_or(0, |e| e.len() as u32),
        };
        if header.total_body_len() > self.max_frame_bytes {
            return Err(TetherError::MalformedFrame("frame exceeds maximum size"));
        }

        let mut head = Vec::with_capacity(FIXED_PREFIX_LEN + 8);
        header.encode(&mut head);
        dst.reserve(head.len() + header.total_body_len());
        dst.extend_from_slice(&head);
        dst.extend_from_slice(&payload);
        if let Some(m) = metadata {
            dst.extend_from_slice(&m);
        }
        if let Some(e) = extra {
            dst.extend_from_slice(&e);
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
