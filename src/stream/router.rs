//! Inbound frame classification, subscription demultiplexing, and the
//! generic websocket listener table.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use crate::stream::client::RealtimeError;
use crate::stream::proto::{
    AuthStatus, ErrorDetail, FrameContent, ServerMessage, SubscriptionFrame,
};
use crate::stream::registry::SubscriptionRegistry;
use crate::stream::transport::CloseInfo;

/// Kinds accepted by [`crate::stream::client::RealtimeClient::on_websocket`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WebSocketEventKind {
    Open,
    Close,
    Error,
    Message,
}

/// Event delivered to websocket listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum WebSocketEvent {
    /// Socket opened (before any handshake).
    Open,
    /// Socket closed, with the peer's close frame when one was received.
    Close(Option<CloseInfo>),
    /// Socket or connection-level error.
    Error(String),
    /// Any inbound JSON frame that is not a subscription frame.
    Message(Value),
}

impl WebSocketEvent {
    pub fn kind(&self) -> WebSocketEventKind {
        match self {
            Self::Open => WebSocketEventKind::Open,
            Self::Close(_) => WebSocketEventKind::Close,
            Self::Error(_) => WebSocketEventKind::Error,
            Self::Message(_) => WebSocketEventKind::Message,
        }
    }
}

type Handler = Arc<dyn Fn(&WebSocketEvent) + Send + Sync>;

/// Dispatch table of websocket listeners keyed by event kind.
#[derive(Default)]
pub(crate) struct EventListeners {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<WebSocketEventKind, Vec<(u64, Handler)>>>,
}

impl EventListeners {
    pub(crate) fn add(&self, kind: WebSocketEventKind, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn remove(&self, kind: WebSocketEventKind, id: u64) {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.get_mut(&kind) {
            list.retain(|(existing, _)| *existing != id);
        }
    }

    /// Invokes every listener of the event's kind, in registration order.
    ///
    /// Handlers run outside the table lock, so a handler may add or remove
    /// listeners.
    pub(crate) fn emit(&self, event: &WebSocketEvent) {
        let targets: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default()
        };
        for handler in targets {
            handler(event);
        }
    }
}

/// Detaches one listener registered through `on_websocket`.
///
/// Removing is idempotent and never affects other listeners. Dropping the
/// remover without calling [`ListenerRemover::remove`] keeps the listener
/// attached.
#[derive(Clone)]
pub struct ListenerRemover {
    listeners: Arc<EventListeners>,
    kind: WebSocketEventKind,
    id: u64,
}

impl ListenerRemover {
    pub(crate) fn new(listeners: Arc<EventListeners>, kind: WebSocketEventKind, id: u64) -> Self {
        Self {
            listeners,
            kind,
            id,
        }
    }

    pub fn remove(&self) {
        self.listeners.remove(self.kind, self.id);
    }
}

impl fmt::Debug for ListenerRemover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRemover")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Subscription(SubscriptionFrame),
    AuthOk(Value),
    AuthRejected(ErrorDetail, Value),
    Ping(Value),
    Pong(Value),
    Other(Value),
}

/// Parses one inbound text frame.
///
/// Non-JSON text and frames whose `type` is known but whose body does not
/// match are protocol anomalies; unknown `type`s are passed through as
/// [`Inbound::Other`].
pub(crate) fn classify(text: &str) -> Result<Inbound, RealtimeError> {
    let value: Value = serde_json::from_str(text)?;
    let known = matches!(
        value.get("type").and_then(Value::as_str),
        Some("subscription" | "auth" | "ping" | "pong")
    );
    if !known {
        return Ok(Inbound::Other(value));
    }

    match ServerMessage::from_value(value.clone())? {
        ServerMessage::Subscription(frame) => Ok(Inbound::Subscription(frame)),
        ServerMessage::Auth {
            status: AuthStatus::Ok,
            ..
        } => Ok(Inbound::AuthOk(value)),
        ServerMessage::Auth {
            status: AuthStatus::Error,
            error,
            ..
        } => Ok(Inbound::AuthRejected(error.unwrap_or_default(), value)),
        ServerMessage::Ping => Ok(Inbound::Ping(value)),
        ServerMessage::Pong => Ok(Inbound::Pong(value)),
    }
}

/// Outcome of routing one subscription frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Delivered,
    /// Payload kind excluded by the subscription's event filter.
    Filtered,
    /// No live subscription owns the uid.
    Unmatched,
    /// The consumer side of the inbox is gone.
    ReceiverGone,
    /// Frame was malformed or lacked a uid.
    Anomaly,
}

/// Pushes a subscription frame into the inbox of the entry owning its uid.
pub(crate) fn route_subscription(
    registry: &SubscriptionRegistry,
    frame: SubscriptionFrame,
) -> RouteOutcome {
    let Some(uid) = frame.uid.clone() else {
        warn!(event = "subscription_frame_without_uid");
        return RouteOutcome::Anomaly;
    };
    let Some(entry) = registry.get(&uid) else {
        warn!(event = "subscription_uid_unmatched", uid = %uid);
        return RouteOutcome::Unmatched;
    };
    let content = match frame.into_content() {
        Ok(content) => content,
        Err(reason) => {
            warn!(event = "subscription_frame_malformed", uid = %uid, reason = %reason);
            return RouteOutcome::Anomaly;
        }
    };

    let item = match content {
        FrameContent::Payload(payload) => {
            if !payload.kind().passes(entry.event) {
                debug!(event = "subscription_payload_filtered", uid = %uid, kind = ?payload.kind());
                return RouteOutcome::Filtered;
            }
            Ok(payload)
        }
        FrameContent::Error(detail) => Err(RealtimeError::Server {
            code: detail.code,
            message: detail.message,
        }),
    };

    if entry.inbox.send(item).is_err() {
        debug!(event = "subscription_receiver_dropped", uid = %uid);
        return RouteOutcome::ReceiverGone;
    }
    RouteOutcome::Delivered
}
