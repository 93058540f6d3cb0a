//! Socket layer: listener, connector, and the per-session I/O tasks.
//!
//! Both endpoints spawn the same writer task per session — a single
//! drain of the FIFO queue, so at most one frame is in flight and
//! frame order equals enqueue order. Reader loops differ per side and
//! live with their endpoint.

pub(crate) mod stream;

mod client;
mod server;

pub use client::Client;
pub use server::Server;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::Framed;
use tracing::warn;

use crate::codec::FrameCodec;
use crate::error::TetherError;
use crate::frame::Frame;
use crate::session::{DisconnectReason, OutboundFrame, QueueRx, Session};
use stream::NetStream;

pub(crate) type FrameSink = SplitSink<Framed<NetStream, FrameCodec>, Frame>;
pub(crate) type FrameStream = SplitStream<Framed<NetStream, FrameCodec>>;

/// Map a read/write error to the reason the session closes with.
pub(crate) fn reason_for(e: &TetherError) -> DisconnectReason {
    match e {
        TetherError::Io(_) | TetherError::ChannelClosed => DisconnectReason::IoError,
        _ => DisconnectReason::ProtocolError,
    }
}

/// The writer task: drains the session's queue and writes one frame at
/// a time. Resolves queued completions as each frame hits the socket.
pub(crate) async fn write_loop(mut sink: FrameSink, mut queue: QueueRx, session: Arc<Session>) {
    let token = session.token().clone();
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = queue.recv() => item,
        };
        let Some(OutboundFrame { frame, done }) = item else {
            break;
        };

        session.writing.store(true, Ordering::Relaxed);
        let result = sink.send(frame).await;
        session.writing.store(false, Ordering::Relaxed);

        match result {
            Ok(()) => {
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(session = session.id(), "write failed: {e}");
                if let Some(done) = done {
                    let _ = done.send(Err(e));
                }
                session.request_close(DisconnectReason::IoError);
                break;
            }
        }
    }
    // half-close our direction; the reader side owns the other half
    let _ = sink.close().await;
}

/// What the reader saw next on the wire.
pub(crate) enum NextFrame {
    Frame(Frame),
    /// Clean FIN from the peer.
    Eof,
    Err(TetherError),
    /// The inactivity timeout elapsed with no traffic.
    Idle,
}

/// Pull the next frame, bounded by the optional inactivity timeout.
pub(crate) async fn next_with_idle(frames: &mut FrameStream, idle: Option<Duration>) -> NextFrame {
    let next = frames.next();
    let item = match idle {
        Some(limit) => match tokio::time::timeout(limit, next).await {
            Ok(item) => item,
            Err(_) => return NextFrame::Idle,
        },
        None => next.await,
    };
    match item {
        Some(Ok(frame)) => NextFrame::Frame(frame),
        Some(Err(e)) => NextFrame::Err(e),
        None => NextFrame::Eof,
    }
}
