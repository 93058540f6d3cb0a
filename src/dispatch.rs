//! Inbound routing: decoded frames become user-visible events.
//!
//! Auth and KeepAlive frames are consumed internally. Everything else
//! either goes to a dynamic callback (when the frame names a
//! registered key) or to the default event for its kind, delivered on
//! the endpoint's event channel. User callbacks are isolated: a panic
//! inside one is caught, logged, and never reaches the reader loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::TetherError;
use crate::frame::{Frame, MessageType, EXTRA_CALLBACK_KEY, EXTRA_TYPE_KEY};
use crate::metadata::KvMap;
use crate::object::{DynObject, ObjectCodec};
use crate::session::{DisconnectReason, Identity, Session, SessionInfo};

/// Sender half of the event channel handed to `listen`/`connect`.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiver half, drained by the application.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

// ── Event ────────────────────────────────────────────────────────

/// User-visible events. On the server, `Connected`/`Disconnected`
/// describe a client session; on the client, the connection to the
/// server.
pub enum Event {
    Connected(SessionInfo),
    Disconnected {
        info: SessionInfo,
        reason: DisconnectReason,
    },
    SslAuthSuccess(SessionInfo),
    SslAuthFailed {
        info: SessionInfo,
        detail: String,
    },
    MessageReceived {
        from: SessionInfo,
        text: String,
        metadata: KvMap,
    },
    ObjectReceived {
        from: SessionInfo,
        object: Option<DynObject>,
        type_name: Option<String>,
        metadata: KvMap,
    },
    BytesReceived {
        from: SessionInfo,
        data: Vec<u8>,
        metadata: KvMap,
    },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(info) => f.debug_tuple("Connected").field(info).finish(),
            Self::Disconnected { info, reason } => f
                .debug_struct("Disconnected")
                .field("info", info)
                .field("reason", reason)
                .finish(),
            Self::SslAuthSuccess(info) => f.debug_tuple("SslAuthSuccess").field(info).finish(),
            Self::SslAuthFailed { info, detail } => f
                .debug_struct("SslAuthFailed")
                .field("info", info)
                .field("detail", detail)
                .finish(),
            Self::MessageReceived { from, text, .. } => f
                .debug_struct("MessageReceived")
                .field("from", &from.id)
                .field("text", text)
                .finish(),
            Self::ObjectReceived {
                from, type_name, ..
            } => f
                .debug_struct("ObjectReceived")
                .field("from", &from.id)
                .field("type_name", type_name)
                .finish(),
            Self::BytesReceived { from, data, .. } => f
                .debug_struct("BytesReceived")
                .field("from", &from.id)
                .field("len", &data.len())
                .finish(),
        }
    }
}

// ── Dynamic callbacks ────────────────────────────────────────────

/// The payload handed to a dynamic callback, tagged by kind.
pub enum Inbound {
    Message {
        text: String,
    },
    Object {
        object: Option<DynObject>,
        type_name: Option<String>,
    },
    Bytes {
        data: Vec<u8>,
    },
}

/// A registered handler, invoked in place of the default event.
pub type DynamicHandler = Arc<dyn Fn(SessionInfo, Inbound, KvMap) + Send + Sync>;

/// What the dispatcher did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    Auth,
    KeepAlive,
    Delivered,
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Shared across all sessions of a server; singleton on a client.
pub struct Dispatcher {
    event_tx: EventSender,
    callbacks: RwLock<HashMap<String, DynamicHandler>>,
    object_codec: Option<Arc<dyn ObjectCodec>>,
}

impl Dispatcher {
    pub(crate) fn new(event_tx: EventSender, object_codec: Option<Arc<dyn ObjectCodec>>) -> Self {
        Self {
            event_tx,
            callbacks: RwLock::new(HashMap::new()),
            object_codec,
        }
    }

    /// Register a handler under `key`. Replaces any previous handler.
    pub fn register_callback<F>(&self, key: impl Into<String>, handler: F)
    where
        F: Fn(SessionInfo, Inbound, KvMap) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.into(), Arc::new(handler));
    }

    /// Remove a handler. Returns whether it existed.
    pub fn unregister_callback(&self, key: &str) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key)
            .is_some()
    }

    /// Push an event to the application. A dropped receiver is not an
    /// error; the I/O loops keep running.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    /// Route one decoded frame.
    pub(crate) fn dispatch(
        &self,
        session: &Session,
        frame: Frame,
    ) -> Result<Dispatched, TetherError> {
        match frame.msg_type() {
            MessageType::Auth => {
                let identity = Identity::parse(frame.payload())?;
                debug!(
                    session = session.id(),
                    name = %identity.name,
                    guid = %identity.guid,
                    "peer identified"
                );
                session.set_identity(identity);
                Ok(Dispatched::Auth)
            }
            MessageType::KeepAlive => {
                session
                    .timed_out
                    .store(false, std::sync::atomic::Ordering::Relaxed);
                Ok(Dispatched::KeepAlive)
            }
            kind => {
                let from = session.info();
                let (payload, metadata, extra) = frame.into_parts();
                let inbound = self.build_inbound(kind, payload, &extra)?;

                if let Some(key) = extra.get(EXTRA_CALLBACK_KEY) {
                    let handler = self
                        .callbacks
                        .read()
                        .unwrap_or_else(|p| p.into_inner())
                        .get(key)
                        .cloned();
                    if let Some(handler) = handler {
                        // the lock is released before the handler runs,
                        // so handlers may (un)register callbacks freely
                        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            handler(from, inbound, metadata)
                        }));
                        if caught.is_err() {
                            error!(key, "dynamic callback panicked");
                        }
                        return Ok(Dispatched::Delivered);
                    }
                }

                self.emit(default_event(from, inbound, metadata));
                Ok(Dispatched::Delivered)
            }
        }
    }

    /// Decode the payload into its tagged form.
    fn build_inbound(
        &self,
        kind: MessageType,
        payload: Vec<u8>,
        extra: &KvMap,
    ) -> Result<Inbound, TetherError> {
        match kind {
            MessageType::Message => {
                let text = String::from_utf8(payload)
                    .map_err(|_| TetherError::MalformedFrame("message payload is not utf-8"))?;
                Ok(Inbound::Message { text })
            }
            MessageType::Bytes => Ok(Inbound::Bytes { data: payload }),
            MessageType::Object => {
                let type_name = extra.get(EXTRA_TYPE_KEY);
                let decoded = match (self.object_codec.as_deref(), type_name) {
                    (Some(codec), Some(name)) => match codec.decode(name, &payload) {
                        Ok(object) => Some((object, name.to_string())),
                        Err(e) => {
                            error!(type_name = name, "object deserialization failed: {e}");
                            None
                        }
                    },
                    (None, Some(name)) => {
                        warn!(type_name = name, "object received but no codec configured");
                        None
                    }
                    (_, None) => {
                        error!("object frame carries no type descriptor");
                        None
                    }
                };
                // failure is benign: the event still fires, with a
                // null object and type
                let (object, type_name) = match decoded {
                    Some((object, name)) => (Some(object), Some(name)),
                    None => (None, None),
                };
                Ok(Inbound::Object { object, type_name })
            }
            MessageType::Auth | MessageType::KeepAlive => {
                unreachable!("handled before payload routing")
            }
        }
    }
}

fn default_event(from: SessionInfo, inbound: Inbound, metadata: KvMap) -> Event {
    match inbound {
        Inbound::Message { text } => Event::MessageReceived {
            from,
            text,
            metadata,
        },
        Inbound::Object { object, type_name } => Event::ObjectReceived {
            from,
            object,
            type_name,
            metadata,
        },
        Inbound::Bytes { data } => Event::BytesReceived {
            from,
            data,
            metadata,
        },
    }
}

// ── Tests ────────────────────────────────────────────────────────
