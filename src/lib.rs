//! tether — bidirectional framed messaging over persistent TCP.
//!
//! A [`Server`] accepts many concurrent client sessions, admits or
//! rejects them by address policy, optionally runs TLS, requires an
//! identification exchange, and then trades typed frames with each
//! peer. A [`Client`] holds one logical connection to one server and
//! reconnects on its own when the link drops.
//!
//! Frames carry a payload, an opaque metadata map, and optional
//! per-frame compression and AES-256-CBC encryption. Inbound frames
//! become events on a channel, or invoke a registered dynamic
//! callback when the sender names one.
//!
//! ```no_run
//! use tether::{Client, ClientConfig, SendOptions, Server, ServerConfig};
//!
//! # async fn demo() -> Result<(), tether::TetherError> {
//! let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let server = Server::listen(
//!     ServerConfig {
//!         port: 12345,
//!         ..Default::default()
//!     },
//!     events_tx,
//! )
//! .await?;
//!
//! let (client_tx, _client_events) = tokio::sync::mpsc::unbounded_channel();
//! let client = Client::connect(
//!     ClientConfig {
//!         host: "127.0.0.1".into(),
//!         port: 12345,
//!         name: "alice".into(),
//!         ..Default::default()
//!     },
//!     client_tx,
//! )
//! .await?;
//! client.ready().await;
//! client
//!     .send_message("hello", SendOptions::new().with_metadata("room", "lobby"))
//!     .await?;
//! # let _ = (server, events.recv().await);
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod dispatch;
mod error;
mod frame;
mod metadata;
mod net;
mod object;
mod policy;
mod session;

pub use codec::{FrameCodec, FrameKey, DEFAULT_MAX_FRAME_BYTES};
pub use config::{
    ClientConfig, SendOptions, ServerConfig, TlsClientConfig, TlsServerConfig,
    DEFAULT_IDENTIFICATION_TIMEOUT_SECS, DEFAULT_RECONNECT_SECS, KEEPALIVE_INTERVAL_SECS,
};
pub use dispatch::{Dispatcher, Event, EventReceiver, EventSender, Inbound};
pub use error::TetherError;
pub use frame::{
    CompressionAlgo, EncryptionAlgo, Frame, FrameFlags, FrameHeader, MessageType, PROTOCOL_VERSION,
};
pub use metadata::KvMap;
pub use net::{Client, Server};
pub use object::{BincodeRegistry, DynObject, ObjectCodec};
pub use policy::{PolicySet, DEFAULT_MAX_CONNECTIONS, MIN_IDLE_TIMEOUT_SECS};
pub use session::{DisconnectReason, Identity, SessionInfo, SessionState};

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default raw-read chunk size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Smallest permitted raw-read chunk size.
pub const MIN_RECV_BUFFER_SIZE: usize = 256;

// The one intentionally process-wide knob. It seeds the read buffer
// of sessions created after the change; live sessions keep theirs.
static RECV_BUFFER_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_RECV_BUFFER_SIZE);

/// The current raw-read chunk size used for new sessions.
pub fn recv_buffer_size() -> usize {
    RECV_BUFFER_SIZE.load(Ordering::Relaxed)
}

/// Reconfigure the raw-read chunk size. Takes effect for new sessions
/// only; must be at least [`MIN_RECV_BUFFER_SIZE`].
pub fn set_recv_buffer_size(bytes: usize) -> Result<(), TetherError> {
    if bytes < MIN_RECV_BUFFER_SIZE {
        return Err(TetherError::Config(format!(
            "receive buffer must be at least {MIN_RECV_BUFFER_SIZE} bytes"
        )));
    }
    RECV_BUFFER_SIZE.store(bytes, Ordering::Relaxed);
    Ok(())
}
