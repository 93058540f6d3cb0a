//! Frame model and wire header.
//!
//! A [`Frame`] is one application message: a type tag, a payload, two
//! optional string maps (metadata surfaced to the peer, extra-info used
//! internally), and the compression/encryption algorithms applied to the
//! body on the wire. Frames are immutable once built.
//!
//! ## Wire layout (big-endian where multi-byte)
//!
//! ```text
//! [0]      version           u8  (currently 1)
//! [1]      msg_type          u8  (Message=1 Object=2 Bytes=3 Auth=4 KeepAlive=5)
//! [2]      flags             u8  (bit0 metadata, bit1 extra, bit2 compressed, bit3 encrypted)
//! [3]      compression_algo  u8  (0 none, 1 gzip, 2 deflate)
//! [4]      encryption_algo   u8  (0 none, 1 aes-256-cbc)
//! [5..9)   reserved          u32 (zero)
//! [9..13)  payload_len       u32
//! [13..17) metadata_len      u32 (present iff bit0)
//! [17..21) extra_len         u32 (present iff bit1)
//! then: payload | metadata | extra
//! ```

use crate::error::TetherError;
use crate::metadata::KvMap;

/// Wire protocol version emitted and accepted by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the fixed header prefix, through `payload_len`.
pub(crate) const FIXED_PREFIX_LEN: usize = 13;

/// Extra-info key carrying a serialized object's type descriptor.
pub(crate) const EXTRA_TYPE_KEY: &str = "Type";

/// Extra-info key routing an inbound frame to a named handler.
pub(crate) const EXTRA_CALLBACK_KEY: &str = "DynamicCallback";

// ── MessageType ──────────────────────────────────────────────────

/// Distinguishes the application payload kinds plus the two internal
/// frame kinds (identification and liveness).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// UTF-8 text message.
    Message = 1,
    /// Serialized object; extra-info names its type.
    Object = 2,
    /// Raw byte payload.
    Bytes = 3,
    /// Identification exchange, first frame a client sends.
    Auth = 4,
    /// Zero-payload liveness probe.
    KeepAlive = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = TetherError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Message),
            2 => Ok(MessageType::Object),
            3 => Ok(MessageType::Bytes),
            4 => Ok(MessageType::Auth),
            5 => Ok(MessageType::KeepAlive),
            _ => Err(TetherError::MalformedFrame("unknown message type")),
        }
    }
}

// ── Body transform tags ──────────────────────────────────────────

/// Compression applied to each body section on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompressionAlgo {
    #[default]
    None = 0,
    Gzip = 1,
    Deflate = 2,
}

impl TryFrom<u8> for CompressionAlgo {
    type Error = TetherError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionAlgo::None),
            1 => Ok(CompressionAlgo::Gzip),
            2 => Ok(CompressionAlgo::Deflate),
            _ => Err(TetherError::MalformedFrame("unknown compression algorithm")),
        }
    }
}

/// Symmetric encryption applied to each body section on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EncryptionAlgo {
    #[default]
    None = 0,
    Aes256Cbc = 1,
}

impl TryFrom<u8> for EncryptionAlgo {
    type Error = TetherError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EncryptionAlgo::None),
            1 => Ok(EncryptionAlgo::Aes256Cbc),
            _ => Err(TetherError::MalformedFrame("unknown encryption algorithm")),
        }
    }
}

// ── FrameFlags ───────────────────────────────────────────────────

/// The header flag byte. Unknown bits are reserved and rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const HAS_METADATA: u8 = 0b0001;
    pub const HAS_EXTRA: u8 = 0b0010;
    pub const COMPRESSED: u8 = 0b0100;
    pub const ENCRYPTED: u8 = 0b1000;

    const KNOWN: u8 = 0b1111;

    /// Build from the raw byte, rejecting reserved bits.
    pub fn from_bits(bits: u8) -> Result<Self, TetherError> {
        if bits & !Self::KNOWN != 0 {
            return Err(TetherError::MalformedFrame("reserved flag bits set"));
        }
        Ok(Self(bits))
    }

    /// The raw byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether all bits of `mask` are set.
    pub fn contains(self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    /// Set the bits of `mask`.
    pub fn set(&mut self, mask: u8) {
        self.0 |= mask;
    }
}

// ── FrameHeader ──────────────────────────────────────────────────

/// Parsed header: the fixed prefix plus however many length words the
/// flags call for. Length fields describe the on-wire body sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub flags: FrameFlags,
    pub compression: CompressionAlgo,
    pub encryption: EncryptionAlgo,
    pub payload_len: u32,
    pub metadata_len: u32,
    pub extra_len: u32,
}

impl FrameHeader {
    /// Parse the 13-byte fixed prefix. The optional length words are
    /// filled in by [`FrameHeader::read_body_lengths`] once buffered.
    pub fn parse_prefix(bytes: &[u8]) -> Result<Self, TetherError> {
        debug_assert!(bytes.len() >= FIXED_PREFIX_LEN);
        if bytes[0] != PROTOCOL_VERSION {
            return Err(TetherError::UnsupportedVersion(bytes[0]));
        }
        let msg_type = MessageType::try_from(bytes[1])?;
        let flags = FrameFlags::from_bits(bytes[2])?;
        let compression = CompressionAlgo::try_from(bytes[3])?;
        let encryption = EncryptionAlgo::try_from(bytes[4])?;
        // bytes[5..9] is the reserved word, ignored on read.
        let payload_len = u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        Ok(Self {
            msg_type,
            flags,
            compression,
            encryption,
            payload_len,
            metadata_len: 0,
            extra_len: 0,
        })
    }

    /// How many additional u32 length words the flags call for.
    pub fn extra_length_words(&self) -> usize {
        let mut n = 0;
        if self.flags.contains(FrameFlags::HAS_METADATA) {
            n += 1;
        }
        if self.flags.contains(FrameFlags::HAS_EXTRA) {
            n += 1;
        }
        n
    }

    /// Fill the optional length fields from their buffered words, in
    /// header order (metadata first).
    pub fn read_body_lengths(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() >= self.extra_length_words() * 4);
        let mut at = 0;
        if self.flags.contains(FrameFlags::HAS_METADATA) {
            self.metadata_len =
                u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            at += 4;
        }
        if self.flags.contains(FrameFlags::HAS_EXTRA) {
            self.extra_len =
                u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
    }

    /// Total on-wire body length.
    pub fn total_body_len(&self) -> usize {
        self.payload_len as usize + self.metadata_len as usize + self.extra_len as usize
    }

    /// Serialize the header, prefix plus any present length words.
    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.push(PROTOCOL_VERSION);
        dst.push(self.msg_type as u8);
        dst.push(self.flags.bits());
        dst.push(self.compression as u8);
        dst.push(self.encryption as u8);
        dst.extend_from_slice(&0u32.to_be_bytes()); // reserved
        dst.extend_from_slice(&self.payload_len.to_be_bytes());
        if self.flags.contains(FrameFlags::HAS_METADATA) {
            dst.extend_from_slice(&self.metadata_len.to_be_bytes());
        }
        if self.flags.contains(FrameFlags::HAS_EXTRA) {
            dst.extend_from_slice(&self.extra_len.to_be_bytes());
        }
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// One application message. Immutable once built.
#[derive(Clone, PartialEq)]
pub struct Frame {
    msg_type: MessageType,
    payload: Vec<u8>,
    metadata: KvMap,
    extra: KvMap,
    compression: CompressionAlgo,
    encryption: EncryptionAlgo,
}

impl Frame {
    /// Build a frame from its parts.
    pub fn new(
        msg_type: MessageType,
        payload: Vec<u8>,
        metadata: KvMap,
        extra: KvMap,
        compression: CompressionAlgo,
        encryption: EncryptionAlgo,
    ) -> Self {
        Self {
            msg_type,
            payload,
            metadata,
            extra,
            compression,
            encryption,
        }
    }

    /// A plain text message with no options.
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(
            MessageType::Message,
            text.into().into_bytes(),
            KvMap::new(),
            KvMap::new(),
            CompressionAlgo::None,
            EncryptionAlgo::None,
        )
    }

    /// A raw byte message with no options.
    pub fn bytes(data: Vec<u8>) -> Self {
        Self::new(
            MessageType::Bytes,
            data,
            KvMap::new(),
            KvMap::new(),
            CompressionAlgo::None,
            EncryptionAlgo::None,
        )
    }

    /// The zero-payload liveness probe.
    pub fn keepalive() -> Self {
        Self::new(
            MessageType::KeepAlive,
            Vec::new(),
            KvMap::new(),
            KvMap::new(),
            CompressionAlgo::None,
            EncryptionAlgo::None,
        )
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn metadata(&self) -> &KvMap {
        &self.metadata
    }

    pub fn extra(&self) -> &KvMap {
        &self.extra
    }

    pub fn compression(&self) -> CompressionAlgo {
        self.compression
    }

    pub fn encryption(&self) -> EncryptionAlgo {
        self.encryption
    }

    /// Consume the frame into (payload, metadata, extra).
    pub fn into_parts(self) -> (Vec<u8>, KvMap, KvMap) {
        (self.payload, self.metadata, self.extra)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("msg_type", &self.msg_type)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .field("extra", &self.extra)
            .field("compression", &self.compression)
            .field("encryption", &self.encryption)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrip() {
        for t in [
            MessageType::Message,
            MessageType::Object,
            MessageType::Bytes,
            MessageType::Auth,
            MessageType::KeepAlive,
        ] {
            assert_eq!(MessageType::try_from(t as u8).unwrap(), t);
        }
    }

    #[test]
    fn message_type_invalid() {
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(6).is_err());
    }

    #[test]
    fn algo_tags_roundtrip() {
        assert_eq!(CompressionAlgo::try_from(1).unwrap(), CompressionAlgo::Gzip);
        assert_eq!(
            CompressionAlgo::try_from(2).unwrap(),
            CompressionAlgo::Deflate
        );
        assert!(CompressionAlgo::try_from(3).is_err());
        assert_eq!(
            EncryptionAlgo::try_from(1).unwrap(),
            EncryptionAlgo::Aes256Cbc
        );
        assert!(EncryptionAlgo::try_from(2).is_err());
    }

    #[test]
    fn flags_reject_reserved_bits() {
        assert!(FrameFlags::from_bits(0b1111).is_ok());
        assert!(FrameFlags::from_bits(0b1_0000).is_err());
    }

    #[test]
    fn header_prefix_roundtrip() {
        let mut flags = FrameFlags::default();
        flags.set(FrameFlags::HAS_METADATA);
        flags.set(FrameFlags::COMPRESSED);
        let header = FrameHeader {
            msg_type: MessageType::Object,
            flags,
            compression: CompressionAlgo::Gzip,
            encryption: EncryptionAlgo::None,
            payload_len: 7,
            metadata_len: 21,
            extra_len: 0,
        };

        let mut wire = Vec::new();
        header.encode(&mut wire);
        assert_eq!(wire.len(), FIXED_PREFIX_LEN + 4);

        let mut parsed = FrameHeader::parse_prefix(&wire).unwrap();
        assert_eq!(parsed.extra_length_words(), 1);
        parsed.read_body_lengths(&wire[FIXED_PREFIX_LEN..]);
        assert_eq!(parsed, header);
        assert_eq!(parsed.total_body_len(), 28);
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut wire = Vec::new();
        FrameHeader {
            msg_type: MessageType::Message,
            flags: FrameFlags::default(),
            compression: CompressionAlgo::None,
            encryption: EncryptionAlgo::None,
            payload_len: 0,
            metadata_len: 0,
            extra_len: 0,
        }
        .encode(&mut wire);
        wire[0] = 2;
        assert!(matches!(
            FrameHeader::parse_prefix(&wire),
            Err(TetherError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn keepalive_is_empty() {
        let frame = Frame::keepalive();
        assert_eq!(frame.msg_type(), MessageType::KeepAlive);
        assert!(frame.payload().is_empty());
        assert!(frame.metadata().is_empty());
    }
}
