//! The connecting endpoint: dial with reconnect, automatic
//! identification, keepalive probes, and the client-side API surface.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use futures::StreamExt;

use crate::codec::{FrameCodec, FrameKey};
use crate::config::{ClientConfig, SendOptions, KEEPALIVE_INTERVAL_SECS};
use crate::dispatch::{Dispatcher, Event, EventSender, Inbound};
use crate::error::TetherError;
use crate::frame::{CompressionAlgo, EncryptionAlgo, Frame, MessageType};
use crate::metadata::KvMap;
use crate::net::stream::{self, NetStream};
use crate::net::{next_with_idle, reason_for, write_loop, FrameStream, NextFrame};
use crate::object::ObjectCodec;
use crate::session::{
    outbound_queue, DisconnectReason, Identity, OutboundFrame, Session, SessionInfo, SessionState,
};

// ── Client ───────────────────────────────────────────────────────

/// One logical connection to one server, kept alive across link
/// failures by the reconnect supervisor.
pub struct Client {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    config: ClientConfig,
    identity: Identity,
    key: Option<FrameKey>,
    dispatcher: Arc<Dispatcher>,
    current: Mutex<Option<Arc<Session>>>,
    /// Cancels the supervisor; set by [`Client::disconnect`].
    token: CancellationToken,
    ready: watch::Sender<bool>,
}

impl ClientShared {
    fn current(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Client {
    /// Validate the config and start the connection supervisor. The
    /// first dial happens in the background; await [`Client::ready`]
    /// to block until the session is up.
    pub async fn connect(config: ClientConfig, event_tx: EventSender) -> Result<Self, TetherError> {
        Self::connect_with_codec(config, event_tx, None).await
    }

    /// Like [`Client::connect`], with an object codec for decoding
    /// inbound object payloads.
    pub async fn connect_with_codec(
        config: ClientConfig,
        event_tx: EventSender,
        object_codec: Option<Arc<dyn ObjectCodec>>,
    ) -> Result<Self, TetherError> {
        config.validate()?;
        // TLS and identity problems surface here, not mid-reconnect
        let connector = config.tls.as_ref().map(stream::tls_connector).transpose()?;
        let server_name = config
            .tls
            .as_ref()
            .map(|tls| stream::tls_server_name(tls, &config.host))
            .transpose()?;

        let identity = Identity {
            name: config.name.clone(),
            guid: if config.guid.is_empty() {
                random_guid()
            } else {
                config.guid.clone()
            },
            user_domain: config.user_domain.clone(),
            os_version: config.os_version.clone(),
        };
        let key = config.passphrase.as_deref().map(FrameKey::derive);
        let (ready, _) = watch::channel(false);

        let shared = Arc::new(ClientShared {
            config,
            identity,
            key,
            dispatcher: Arc::new(Dispatcher::new(event_tx, object_codec)),
            current: Mutex::new(None),
            token: CancellationToken::new(),
            ready,
        });

        tokio::spawn(supervise(Arc::clone(&shared), connector, server_name));
        Ok(Self { shared })
    }

    /// Resolves once the session is `Ready`. Returns `false` if the
    /// client was cancelled first.
    pub async fn ready(&self) -> bool {
        let mut rx = self.shared.ready.subscribe();
        tokio::select! {
            _ = self.shared.token.cancelled() => false,
            up = rx.wait_for(|up| *up) => up.is_ok(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .current()
            .as_ref()
            .is_some_and(|s| s.is_ready())
    }

    /// Snapshot of the live session, if any.
    pub fn info(&self) -> Option<SessionInfo> {
        self.shared.current().as_ref().map(|s| s.info())
    }

    /// This client's GUID as sent in identification.
    pub fn guid(&self) -> &str {
        &self.shared.identity.guid
    }

    // ── Dynamic callbacks ────────────────────────────────────────

    pub fn register_callback<F>(&self, key: impl Into<String>, handler: F)
    where
        F: Fn(SessionInfo, Inbound, KvMap) + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_callback(key, handler);
    }

    pub fn unregister_callback(&self, key: &str) -> bool {
        self.shared.dispatcher.unregister_callback(key)
    }

    // ── Sending ──────────────────────────────────────────────────

    fn session(&self) -> Result<Arc<Session>, TetherError> {
        self.shared
            .current()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TetherError::NotConnected)
    }

    /// Send a text message. Resolves when the bytes hit the socket
    /// buffer.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        options: SendOptions,
    ) -> Result<(), TetherError> {
        let frame = options.into_frame(MessageType::Message, text.into().into_bytes());
        self.session()?.send_frame(frame).await
    }

    /// Send a raw byte payload.
    pub async fn send_bytes(&self, data: Vec<u8>, options: SendOptions) -> Result<(), TetherError> {
        let frame = options.into_frame(MessageType::Bytes, data);
        self.session()?.send_frame(frame).await
    }

    /// Send a serialized object with its type descriptor.
    pub async fn send_object(
        &self,
        payload: Vec<u8>,
        type_name: &str,
        options: SendOptions,
    ) -> Result<(), TetherError> {
        let frame = options.into_object_frame(payload, type_name);
        self.session()?.send_frame(frame).await
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Stop reconnecting and close the live session, if any.
    pub fn disconnect(&self) {
        self.shared.token.cancel();
        if let Some(session) = self.shared.current().as_ref() {
            session.request_close(DisconnectReason::Normal);
        }
    }
}

fn random_guid() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

// ── Supervisor ───────────────────────────────────────────────────

/// Dial, run the connection to completion, wait the configured delay,
/// repeat. Only cancellation ends the loop.
async fn supervise(
    shared: Arc<ClientShared>,
    connector: Option<TlsConnector>,
    server_name: Option<ServerName<'static>>,
) {
    loop {
        if shared.token.is_cancelled() {
            break;
        }
        if let Err(e) = run_connection(&shared, connector.as_ref(), server_name.as_ref()).await {
            warn!(
                host = %shared.config.host,
                port = shared.config.port,
                "connection attempt failed: {e}"
            );
        }
        if shared.token.is_cancelled() {
            break;
        }

        let delay = shared.config.reconnect_delay();
        debug!("reconnecting in {delay:?}");
        tokio::select! {
            _ = shared.token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("client supervisor stopped");
}

/// One connection cycle. `Err` means the link never came up (no
/// events fired); `Ok` means a full `Connected`/`Disconnected` pair
/// was emitted.
async fn run_connection(
    shared: &Arc<ClientShared>,
    connector: Option<&TlsConnector>,
    server_name: Option<&ServerName<'static>>,
) -> Result<(), TetherError> {
    let addr = (shared.config.host.as_str(), shared.config.port);
    let socket = tokio::select! {
        _ = shared.token.cancelled() => return Ok(()),
        socket = TcpStream::connect(addr) => socket?,
    };
    let _ = socket.set_nodelay(true);
    let peer = socket.peer_addr().ok();

    let (queue_tx, queue_rx) = outbound_queue(shared.config.max_queue_depth);
    let session = Arc::new(Session::new(0, peer, queue_tx, shared.token.child_token()));

    let net_stream = match connector {
        Some(connector) => {
            let _ = session.transition(SessionState::begin_tls);
            let name = server_name
                .cloned()
                .ok_or_else(|| TetherError::Config("missing tls server name".into()))?;
            match connector.connect(name, socket).await {
                Ok(tls_stream) => {
                    shared.dispatcher.emit(Event::SslAuthSuccess(session.info()));
                    NetStream::ClientTls(Box::new(tls_stream))
                }
                Err(e) => {
                    shared.dispatcher.emit(Event::SslAuthFailed {
                        info: session.info(),
                        detail: e.to_string(),
                    });
                    let _ = session.transition(SessionState::fail);
                    return Err(TetherError::Tls(e.to_string()));
                }
            }
        }
        None => NetStream::Plain(socket),
    };

    // identification: auth is the first frame on the wire
    let _ = session.transition(SessionState::begin_identification);
    session.set_identity(shared.identity.clone());
    session.enqueue(OutboundFrame {
        frame: Frame::new(
            MessageType::Auth,
            shared.identity.to_payload(),
            KvMap::new(),
            KvMap::new(),
            CompressionAlgo::None,
            EncryptionAlgo::None,
        ),
        done: None,
    })?;
    let _ = session.transition(SessionState::mark_ready);

    *shared.current() = Some(Arc::clone(&session));
    let _ = shared.ready.send_replace(true);
    shared.dispatcher.emit(Event::Connected(session.info()));
    info!(
        host = %shared.config.host,
        port = shared.config.port,
        "connected"
    );

    let codec = FrameCodec::new(shared.config.max_frame_bytes, shared.key.clone());
    let framed = Framed::with_capacity(net_stream, codec, crate::recv_buffer_size());
    let (sink, mut frames) = framed.split();
    let writer = tokio::spawn(write_loop(sink, queue_rx, Arc::clone(&session)));
    let prober = tokio::spawn(keepalive_loop(Arc::clone(&session)));

    let reason = read_loop(shared, &session, &mut frames).await;

    session.request_close(reason);
    let reason = session.close_reason().unwrap_or(reason);
    let _ = writer.await;
    let _ = prober.await;
    drop(frames);

    let _ = shared.ready.send_replace(false);
    *shared.current() = None;
    if session.claim_teardown() {
        let _ = session.transition(SessionState::begin_close);
        let _ = session.transition(SessionState::finish_close);
        shared.dispatcher.emit(Event::Disconnected {
            info: session.info(),
            reason,
        });
        info!(%reason, "disconnected");
    }
    Ok(())
}

/// Periodic liveness probe. A broken link surfaces as a failed write,
/// which closes the session and lets the supervisor reconnect.
async fn keepalive_loop(session: Arc<Session>) {
    let mut interval = tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    interval.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = session.token().cancelled() => break,
            _ = interval.tick() => {}
        }
        if session
            .enqueue(OutboundFrame {
                frame: Frame::keepalive(),
                done: None,
            })
            .is_err()
        {
            break;
        }
    }
}

/// The client reader: dispatch frames until the link drops. The
/// server never times us out here; probes keep the link warm.
async fn read_loop(
    shared: &Arc<ClientShared>,
    session: &Arc<Session>,
    frames: &mut FrameStream,
) -> DisconnectReason {
    let token = session.token().clone();
    loop {
        session
            .receiving
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return session.close_reason().unwrap_or(DisconnectReason::Normal);
            }
            next = next_with_idle(frames, None) => next,
        };
        session
            .receiving
            .store(false, std::sync::atomic::Ordering::Relaxed);
        match next {
            NextFrame::Frame(frame) => {
                if let Err(e) = shared.dispatcher.dispatch(session, frame) {
                    warn!("protocol violation: {e}");
                    return DisconnectReason::ProtocolError;
                }
            }
            NextFrame::Eof => return DisconnectReason::PeerClosed,
            NextFrame::Err(e) => {
                warn!("read failed: {e}");
                return reason_for(&e);
            }
            NextFrame::Idle => unreachable!("client reads have no idle bound"),
        }
    }
}
