//! The listening endpoint: accept loop with admission control, the
//! session map, and the server-side API surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use futures::StreamExt;

use crate::codec::{FrameCodec, FrameKey};
use crate::config::{SendOptions, ServerConfig};
use crate::dispatch::{Dispatched, Dispatcher, Event, EventSender, Inbound};
use crate::error::TetherError;
use crate::frame::MessageType;
use crate::metadata::KvMap;
use crate::net::stream::{self, NetStream};
use crate::net::{next_with_idle, reason_for, write_loop, FrameStream, NextFrame};
use crate::object::ObjectCodec;
use crate::session::{
    outbound_queue, DisconnectReason, QueueRx, Session, SessionInfo, SessionState,
};

// ── Server ───────────────────────────────────────────────────────

/// A listening endpoint accepting many concurrent client sessions.
pub struct Server {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    config: ServerConfig,
    local_addr: SocketAddr,
    key: Option<FrameKey>,
    dispatcher: Arc<Dispatcher>,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    next_id: AtomicU64,
    /// The accept gate: cleared while the session map is full.
    can_accept: watch::Sender<bool>,
    accept_token: CancellationToken,
}

struct SessionEntry {
    session: Arc<Session>,
    handle: Option<JoinHandle<()>>,
}

impl ServerShared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Server {
    /// Bind and start accepting. Events arrive on `event_tx`.
    pub async fn listen(config: ServerConfig, event_tx: EventSender) -> Result<Self, TetherError> {
        Self::listen_with_codec(config, event_tx, None).await
    }

    /// Like [`Server::listen`], with an object codec for decoding
    /// inbound object payloads.
    pub async fn listen_with_codec(
        config: ServerConfig,
        event_tx: EventSender,
        object_codec: Option<Arc<dyn ObjectCodec>>,
    ) -> Result<Self, TetherError> {
        config.validate()?;
        let listener = bind_listener(&config)?;
        let local_addr = listener.local_addr()?;
        let tls = config.tls.as_ref().map(stream::tls_acceptor).transpose()?;
        let key = config.passphrase.as_deref().map(FrameKey::derive);
        let (can_accept, _) = watch::channel(true);

        let shared = Arc::new(ServerShared {
            config,
            local_addr,
            key,
            dispatcher: Arc::new(Dispatcher::new(event_tx, object_codec)),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            can_accept,
            accept_token: CancellationToken::new(),
        });

        info!(addr = %local_addr, "listening");
        tokio::spawn(accept_loop(Arc::clone(&shared), listener, tls));
        Ok(Self { shared })
    }

    /// The bound address, useful when the port was OS-assigned.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn is_client_connected(&self, id: u64) -> bool {
        self.shared.sessions().contains_key(&id)
    }

    pub fn client(&self, id: u64) -> Option<SessionInfo> {
        self.shared.sessions().get(&id).map(|e| e.session.info())
    }

    pub fn client_by_guid(&self, guid: &str) -> Option<SessionInfo> {
        self.shared
            .sessions()
            .values()
            .find(|e| e.session.guid().as_deref() == Some(guid))
            .map(|e| e.session.info())
    }

    pub fn clients(&self) -> Vec<SessionInfo> {
        self.shared
            .sessions()
            .values()
            .map(|e| e.session.info())
            .collect()
    }

    // ── Dynamic callbacks ────────────────────────────────────────

    /// Register a handler invoked for frames carrying this callback
    /// key, in place of the default event.
    pub fn register_callback<F>(&self, key: impl Into<String>, handler: F)
    where
        F: Fn(SessionInfo, Inbound, KvMap) + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_callback(key, handler);
    }

    /// Remove a handler. Returns whether it existed.
    pub fn unregister_callback(&self, key: &str) -> bool {
        self.shared.dispatcher.unregister_callback(key)
    }

    // ── Sending ──────────────────────────────────────────────────

    fn session(&self, id: u64) -> Result<Arc<Session>, TetherError> {
        self.shared
            .sessions()
            .get(&id)
            .map(|e| Arc::clone(&e.session))
            .ok_or(TetherError::NotConnected)
    }

    /// Send a text message. Resolves when the bytes hit the socket
    /// buffer.
    pub async fn send_message(
        &self,
        id: u64,
        text: impl Into<String>,
        options: SendOptions,
    ) -> Result<(), TetherError> {
        let frame = options.into_frame(MessageType::Message, text.into().into_bytes());
        self.session(id)?.send_frame(frame).await
    }

    /// Send a raw byte payload.
    pub async fn send_bytes(
        &self,
        id: u64,
        data: Vec<u8>,
        options: SendOptions,
    ) -> Result<(), TetherError> {
        let frame = options.into_frame(MessageType::Bytes, data);
        self.session(id)?.send_frame(frame).await
    }

    /// Send a serialized object with its type descriptor.
    pub async fn send_object(
        &self,
        id: u64,
        payload: Vec<u8>,
        type_name: &str,
        options: SendOptions,
    ) -> Result<(), TetherError> {
        let frame = options.into_object_frame(payload, type_name);
        self.session(id)?.send_frame(frame).await
    }

    /// Queue a text message to every connected session. Returns how
    /// many sessions accepted the frame.
    pub fn broadcast_message(&self, text: &str, options: SendOptions) -> usize {
        self.broadcast(options.into_frame(MessageType::Message, text.as_bytes().to_vec()))
    }

    /// Queue a byte payload to every connected session.
    pub fn broadcast_bytes(&self, data: &[u8], options: SendOptions) -> usize {
        self.broadcast(options.into_frame(MessageType::Bytes, data.to_vec()))
    }

    fn broadcast(&self, frame: crate::frame::Frame) -> usize {
        // snapshot under the lock, enqueue outside it
        let targets: Vec<Arc<Session>> = self
            .shared
            .sessions()
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect();
        let mut queued = 0;
        for session in targets {
            if session
                .enqueue(crate::session::OutboundFrame {
                    frame: frame.clone(),
                    done: None,
                })
                .is_ok()
            {
                queued += 1;
            }
        }
        queued
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Close one session. The disconnect event carries `reason`.
    pub fn shutdown_client(&self, id: u64, reason: DisconnectReason) -> Result<(), TetherError> {
        let session = self.session(id)?;
        session.request_close(reason);
        Ok(())
    }

    /// Stop accepting, close every session, and wait up to `grace`
    /// before hard-closing what remains.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.accept_token.cancel();
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions()
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect();
        for session in sessions {
            session.request_close(DisconnectReason::Normal);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.shared.sessions().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                let remaining: Vec<SessionEntry> =
                    self.shared.sessions().drain().map(|(_, e)| e).collect();
                warn!(count = remaining.len(), "grace period elapsed, hard-closing");
                for entry in remaining {
                    if let Some(handle) = entry.handle {
                        handle.abort();
                        let _ = handle.await;
                    }
                    if entry.session.claim_teardown() {
                        self.shared.dispatcher.emit(Event::Disconnected {
                            info: entry.session.info(),
                            reason: DisconnectReason::Normal,
                        });
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("server shut down");
    }
}

/// Bind with a listen backlog matching the connection cap, and with
/// address reuse so a restarted server can rebind immediately.
fn bind_listener(config: &ServerConfig) -> Result<TcpListener, TetherError> {
    let addr = config.bind_addr()?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(config.policy.max_connections.min(u32::MAX as usize) as u32)?)
}

// ── Accept loop ──────────────────────────────────────────────────

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, tls: Option<TlsAcceptor>) {
    let token = shared.accept_token.clone();
    let mut gate = shared.can_accept.subscribe();
    loop {
        // hold accepts while the session map is full
        if !*gate.borrow() {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = gate.wait_for(|open| *open) => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };

        if !shared.config.policy.is_connection_allowed(&peer.ip()) {
            // refused before any event fires
            debug!(%peer, "refused: {}", TetherError::PolicyDenied);
            drop(socket);
            continue;
        }

        let _ = socket.set_nodelay(true);
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (queue_tx, queue_rx) = outbound_queue(shared.config.max_queue_depth);
        let session = Arc::new(Session::new(id, Some(peer), queue_tx, CancellationToken::new()));

        {
            let mut sessions = shared.sessions();
            sessions.insert(
                id,
                SessionEntry {
                    session: Arc::clone(&session),
                    handle: None,
                },
            );
            if sessions.len() >= shared.config.policy.max_connections {
                let _ = shared.can_accept.send_replace(false);
            }
        }
        shared.dispatcher.emit(Event::Connected(session.info()));
        info!(session = id, %peer, "client connected");

        let handle = tokio::spawn(run_session(
            Arc::clone(&shared),
            Arc::clone(&session),
            socket,
            tls.clone(),
            queue_rx,
        ));
        if let Some(entry) = shared.sessions().get_mut(&id) {
            entry.handle = Some(handle);
        }
    }
    debug!("accept loop stopped");
}

// ── Per-session driver ───────────────────────────────────────────

async fn run_session(
    shared: Arc<ServerShared>,
    session: Arc<Session>,
    socket: TcpStream,
    tls: Option<TlsAcceptor>,
    queue: QueueRx,
) {
    let stream = match tls {
        Some(acceptor) => {
            let _ = session.transition(SessionState::begin_tls);
            match acceptor.accept(socket).await {
                Ok(tls_stream) => {
                    shared.dispatcher.emit(Event::SslAuthSuccess(session.info()));
                    NetStream::ServerTls(Box::new(tls_stream))
                }
                Err(e) => {
                    warn!(session = session.id(), "tls handshake failed: {e}");
                    shared.dispatcher.emit(Event::SslAuthFailed {
                        info: session.info(),
                        detail: e.to_string(),
                    });
                    let _ = session.transition(SessionState::fail);
                    finish_session(&shared, &session, DisconnectReason::ProtocolError);
                    return;
                }
            }
        }
        None => NetStream::Plain(socket),
    };
    let _ = session.transition(SessionState::begin_identification);

    let codec = FrameCodec::new(shared.config.max_frame_bytes, shared.key.clone());
    let framed = Framed::with_capacity(stream, codec, crate::recv_buffer_size());
    let (sink, mut frames) = framed.split();
    let writer = tokio::spawn(write_loop(sink, queue, Arc::clone(&session)));

    let reason = read_loop(&shared, &session, &mut frames).await;

    session.request_close(reason);
    let reason = session.close_reason().unwrap_or(reason);
    let _ = writer.await;
    drop(frames);
    finish_session(&shared, &session, reason);
}

/// The reader loop: identification first, then frame traffic until
/// the session ends. Returns the close reason.
async fn read_loop(
    shared: &ServerShared,
    session: &Arc<Session>,
    frames: &mut FrameStream,
) -> DisconnectReason {
    let token = session.token().clone();

    // the peer must identify itself before anything else
    let id_timeout = Duration::from_secs(shared.config.identification_timeout_secs);
    let first = tokio::select! {
        biased;
        _ = token.cancelled() => {
            return session.close_reason().unwrap_or(DisconnectReason::Normal);
        }
        first = tokio::time::timeout(id_timeout, frames.next()) => first,
    };
    match first {
        Err(_) => {
            warn!(
                session = session.id(),
                "{}",
                TetherError::IdentificationTimeout
            );
            let _ = session.transition(SessionState::fail);
            return DisconnectReason::Timeout;
        }
        Ok(None) => return DisconnectReason::PeerClosed,
        Ok(Some(Err(e))) => {
            warn!(session = session.id(), "read failed during identification: {e}");
            let _ = session.transition(SessionState::fail);
            return reason_for(&e);
        }
        Ok(Some(Ok(frame))) => {
            // the frame kind is checked before dispatch so nothing an
            // unidentified peer sends can reach a user handler
            if frame.msg_type() != MessageType::Auth {
                warn!(
                    session = session.id(),
                    "first frame was not auth: {}",
                    TetherError::MalformedAuth
                );
                let _ = session.transition(SessionState::fail);
                return DisconnectReason::ProtocolError;
            }
            match shared.dispatcher.dispatch(session, frame) {
                Ok(Dispatched::Auth) => {
                    let _ = session.transition(SessionState::mark_ready);
                }
                Ok(_) | Err(_) => {
                    warn!(session = session.id(), "identification rejected");
                    let _ = session.transition(SessionState::fail);
                    return DisconnectReason::ProtocolError;
                }
            }
        }
    }

    let idle = shared.config.policy.idle_timeout();
    loop {
        session.receiving.store(true, Ordering::Relaxed);
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return session.close_reason().unwrap_or(DisconnectReason::Normal);
            }
            next = next_with_idle(frames, idle) => next,
        };
        session.receiving.store(false, Ordering::Relaxed);

        match next {
            NextFrame::Frame(frame) => {
                if let Err(e) = shared.dispatcher.dispatch(session, frame) {
                    warn!(session = session.id(), "protocol violation: {e}");
                    return DisconnectReason::ProtocolError;
                }
            }
            NextFrame::Eof => return DisconnectReason::PeerClosed,
            NextFrame::Idle => {
                session.timed_out.store(true, Ordering::Relaxed);
                warn!(session = session.id(), "inactivity timeout");
                return DisconnectReason::Timeout;
            }
            NextFrame::Err(e) => {
                warn!(session = session.id(), "read failed: {e}");
                return reason_for(&e);
            }
        }
    }
}

/// Remove the session from the map, reopen the accept gate, and emit
/// the disconnection event — exactly once, after all inbound events.
fn finish_session(shared: &ServerShared, session: &Arc<Session>, reason: DisconnectReason) {
    if !session.claim_teardown() {
        return;
    }
    let _ = session.transition(SessionState::begin_close);
    let _ = session.transition(SessionState::finish_close);

    {
        let mut sessions = shared.sessions();
        sessions.remove(&session.id());
        if sessions.len() < shared.config.policy.max_connections {
            let _ = shared.can_accept.send_replace(true);
        }
    }

    shared.dispatcher.emit(Event::Disconnected {
        info: session.info(),
        reason,
    });
    info!(session = session.id(), %reason, "client disconnected");
}
