//! Per-connection state: lifecycle machine, identity, liveness flags,
//! and the outbound queue handle.
//!
//! Exactly one reader task and one writer task run per session; both
//! observe the session's cancellation token. Teardown is guarded so
//! the socket closes once and the disconnection event fires once, no
//! matter how many shutdown paths race.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::TetherError;
use crate::frame::Frame;

// ── DisconnectReason ─────────────────────────────────────────────

/// Why a session ended. Carried by the disconnection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local shutdown request.
    Normal,
    /// The peer closed the connection.
    PeerClosed,
    /// Inactivity or identification timeout.
    Timeout,
    /// Closed by address policy.
    PolicyDenied,
    /// The peer violated the wire protocol.
    ProtocolError,
    /// The socket failed.
    IoError,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::PeerClosed => "peer closed",
            Self::Timeout => "timeout",
            Self::PolicyDenied => "policy denied",
            Self::ProtocolError => "protocol error",
            Self::IoError => "io error",
        };
        f.write_str(s)
    }
}

// ── SessionState ─────────────────────────────────────────────────

/// The lifecycle of one connection.
///
/// ```text
///  Created ──► HandshakingTls? ──► Identifying ──► Ready
///                   │                   │            │
///                   ▼                   ▼            ▼
///                Failed              Failed       Closing ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Socket accepted or dialled; nothing exchanged yet.
    #[default]
    Created,
    /// TLS handshake in progress.
    HandshakingTls,
    /// Waiting for (or about to send) the Auth frame.
    Identifying,
    /// Identification complete; full traffic allowed.
    Ready {
        /// When the session became ready.
        since: Instant,
    },
    /// Shutdown in progress.
    Closing,
    /// Terminal: socket closed, disconnect event emitted.
    Closed,
    /// Terminal: handshake or identification failed.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::HandshakingTls => "HandshakingTls",
            Self::Identifying => "Identifying",
            Self::Ready { .. } => "Ready",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Whether sends may be queued in this state. Frames queued before
    /// `Ready` are written once the writer drains them.
    pub fn may_send(&self) -> bool {
        matches!(
            self,
            Self::HandshakingTls | Self::Identifying | Self::Ready { .. }
        )
    }

    /// How long the session has been `Ready`.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Ready { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Created`.
    pub fn begin_tls(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Created => {
                *self = Self::HandshakingTls;
                Ok(())
            }
            _ => Err(TetherError::InvalidState("tls handshake already started")),
        }
    }

    /// Valid from: `Created`, `HandshakingTls`.
    pub fn begin_identification(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Created | Self::HandshakingTls => {
                *self = Self::Identifying;
                Ok(())
            }
            _ => Err(TetherError::InvalidState(
                "cannot identify outside handshake",
            )),
        }
    }

    /// Valid from: `Identifying`.
    pub fn mark_ready(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Identifying => {
                *self = Self::Ready {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(TetherError::InvalidState("not identifying")),
        }
    }

    /// Valid from any non-terminal state.
    pub fn begin_close(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Closing | Self::Closed | Self::Failed => {
                Err(TetherError::InvalidState("already closing"))
            }
            _ => {
                *self = Self::Closing;
                Ok(())
            }
        }
    }

    /// Valid from: `Closing`.
    pub fn finish_close(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Closing => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(TetherError::InvalidState("not closing")),
        }
    }

    /// Valid from: `HandshakingTls`, `Identifying`.
    pub fn fail(&mut self) -> Result<(), TetherError> {
        match self {
            Self::HandshakingTls | Self::Identifying => {
                *self = Self::Failed;
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot fail from this state")),
        }
    }
}

// ── Identity ─────────────────────────────────────────────────────

/// The fields exchanged in the Auth frame:
/// `name|guid|user_domain|os_version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub guid: String,
    pub user_domain: String,
    pub os_version: String,
}

impl Identity {
    /// Parse an Auth payload. Exactly four `|`-separated UTF-8 fields.
    pub fn parse(payload: &[u8]) -> Result<Self, TetherError> {
        let text = std::str::from_utf8(payload).map_err(|_| TetherError::MalformedAuth)?;
        let mut fields = text.split('|');
        let (name, guid, user_domain, os_version) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(a), Some(b), Some(c), Some(d), None) => (a, b, c, d),
            _ => return Err(TetherError::MalformedAuth),
        };
        Ok(Self {
            name: name.into(),
            guid: guid.into(),
            user_domain: user_domain.into(),
            os_version: os_version.into(),
        })
    }

    /// Serialize to the Auth payload form.
    pub fn to_payload(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}",
            self.name, self.guid, self.user_domain, self.os_version
        )
        .into_bytes()
    }
}

// ── Outbound queue ───────────────────────────────────────────────

/// One queued frame and the optional completion fired when its bytes
/// reach the socket.
pub(crate) struct OutboundFrame {
    pub frame: Frame,
    pub done: Option<oneshot::Sender<Result<(), TetherError>>>,
}

/// Sender half of the per-session FIFO. Bounded queues fail fast with
/// `Backpressure`; unbounded queues always accept.
pub(crate) enum QueueTx {
    Bounded(mpsc::Sender<OutboundFrame>),
    Unbounded(mpsc::UnboundedSender<OutboundFrame>),
}

pub(crate) enum QueueRx {
    Bounded(mpsc::Receiver<OutboundFrame>),
    Unbounded(mpsc::UnboundedReceiver<OutboundFrame>),
}

/// Build the outbound queue for one session.
pub(crate) fn outbound_queue(depth: Option<usize>) -> (QueueTx, QueueRx) {
    match depth {
        Some(depth) => {
            let (tx, rx) = mpsc::channel(depth.max(1));
            (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
        }
    }
}

impl QueueTx {
    fn push(&self, item: OutboundFrame) -> Result<(), TetherError> {
        match self {
            Self::Bounded(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TetherError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => TetherError::ChannelClosed,
            }),
            Self::Unbounded(tx) => tx.send(item).map_err(|_| TetherError::ChannelClosed),
        }
    }
}

impl QueueRx {
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// One live connection and its associated state. Shared between the
/// endpoint API, the reader task, and the writer task.
pub struct Session {
    id: u64,
    peer_ipv4: Option<String>,
    peer_ipv6: Option<String>,
    state: Mutex<SessionState>,
    identity: Mutex<Option<Identity>>,
    outbound: QueueTx,
    token: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
    torn_down: AtomicBool,
    /// Liveness flags, informational.
    pub(crate) receiving: AtomicBool,
    pub(crate) writing: AtomicBool,
    pub(crate) timed_out: AtomicBool,
}

impl Session {
    /// `token` is the session's cancellation root; the client passes a
    /// child of its own token so one cancel stops everything.
    pub(crate) fn new(
        id: u64,
        peer: Option<SocketAddr>,
        outbound: QueueTx,
        token: CancellationToken,
    ) -> Self {
        let (peer_ipv4, peer_ipv6) = match peer.map(|a| a.ip()) {
            Some(ip @ std::net::IpAddr::V4(_)) => (Some(ip.to_string()), None),
            Some(ip @ std::net::IpAddr::V6(_)) => (None, Some(ip.to_string())),
            None => (None, None),
        };
        Self {
            id,
            peer_ipv4,
            peer_ipv6,
            state: Mutex::new(SessionState::Created),
            identity: Mutex::new(None),
            outbound,
            token,
            reason: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    // poison-proof lock: a panicked holder cannot brick the session
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run a transition on the state machine.
    pub(crate) fn transition(
        &self,
        f: impl FnOnce(&mut SessionState) -> Result<(), TetherError>,
    ) -> Result<(), TetherError> {
        f(&mut self.lock_state())
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().is_ready()
    }

    // ── Identity ─────────────────────────────────────────────────

    pub(crate) fn set_identity(&self, identity: Identity) {
        *self.identity.lock().unwrap_or_else(|p| p.into_inner()) = Some(identity);
    }

    pub fn guid(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|i| i.guid.clone())
    }

    /// Snapshot of the session for events and the query API.
    pub fn info(&self) -> SessionInfo {
        let identity = self
            .identity
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or_default();
        SessionInfo {
            id: self.id,
            name: identity.name,
            guid: identity.guid,
            user_domain: identity.user_domain,
            os_version: identity.os_version,
            ipv4: self.peer_ipv4.clone(),
            ipv6: self.peer_ipv6.clone(),
            connected_for: self.lock_state().connected_duration(),
        }
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Queue a frame without waiting for the write.
    pub(crate) fn enqueue(&self, item: OutboundFrame) -> Result<(), TetherError> {
        if !self.lock_state().may_send() {
            return Err(TetherError::NotConnected);
        }
        self.outbound.push(item)
    }

    /// Queue a frame and resolve when its bytes hit the socket buffer.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), TetherError> {
        let (done, wait) = oneshot::channel();
        self.enqueue(OutboundFrame {
            frame,
            done: Some(done),
        })?;
        wait.await?
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Record the disconnect reason (first writer wins) and signal
    /// both tasks to stop.
    pub(crate) fn request_close(&self, reason: DisconnectReason) {
        let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
        slot.get_or_insert(reason);
        drop(slot);
        self.token.cancel();
    }

    /// The reason recorded by the first close request, if any.
    pub(crate) fn close_reason(&self) -> Option<DisconnectReason> {
        *self.reason.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim the right to tear the session down. Returns `true`
    /// exactly once.
    pub(crate) fn claim_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("ipv4", &self.peer_ipv4)
            .field("ipv6", &self.peer_ipv6)
            .finish()
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub id: u64,
    pub name: String,
    pub guid: String,
    pub user_domain: String,
    pub os_version: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub connected_for: Option<Duration>,
}

// ── Tests ────────────────────────────────────────────────────────
