//! Realtime websocket client: connection manager and outbound sender.
//!
//! A single background worker owns the socket. The client handle registers
//! subscriptions, queues outbound messages while the socket is not usable,
//! and replays every live subscription whenever the connection (re)opens.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, ReconnectPolicy};
use crate::stream::proto::ClientMessage;
use crate::stream::registry::{InboxItem, SubscriptionInfo, SubscriptionRegistry};
use crate::stream::router::{
    classify, route_subscription, EventListeners, Inbound, ListenerRemover, WebSocketEvent,
    WebSocketEventKind,
};
use crate::stream::session::{SubscribeOptions, Subscription, Unsubscriber};
use crate::stream::transport::{BoxSocket, Connector, Frame, TransportError, TungsteniteConnector};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);
/// Path appended to the base URL when no explicit websocket URL is set.
pub const WEBSOCKET_PATH: &str = "/websocket";

/// How the client authenticates against the realtime endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// No authentication.
    #[default]
    Public,
    /// Send an auth message after the socket opens and wait for the
    /// acknowledgement before the connection counts as usable.
    Handshake,
    /// Pass the access token as an `access_token` query parameter.
    Strict,
}

/// Credentials used by [`AuthMode::Handshake`] and [`AuthMode::Strict`].
#[derive(Clone, Debug)]
pub enum Credentials {
    AccessToken(SecretString),
    Login { email: String, password: SecretString },
}

impl Credentials {
    fn auth_message(&self) -> ClientMessage {
        match self {
            Self::AccessToken(token) => ClientMessage::Auth {
                access_token: Some(token.expose_secret().clone()),
                email: None,
                password: None,
            },
            Self::Login { email, password } => ClientMessage::Auth {
                access_token: None,
                email: Some(email.clone()),
                password: Some(password.expose_secret().clone()),
            },
        }
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct RealtimeOptions {
    pub auth_mode: AuthMode,
    pub credentials: Option<Credentials>,
    pub reconnect: ReconnectPolicy,
    /// Send `{"type":"ping"}` after `heartbeat_interval` of inbound silence and
    /// answer server pings with pongs.
    pub heartbeat: bool,
    pub heartbeat_interval: Duration,
    /// How long to wait for any inbound frame after a heartbeat ping before
    /// the connection is treated as dropped.
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Explicit websocket URL. Takes precedence over the derived endpoint.
    pub url: Option<String>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::Public,
            credentials: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            url: None,
        }
    }
}

impl RealtimeOptions {
    pub fn with_auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    pub fn with_access_token(mut self, token: SecretString) -> Self {
        self.credentials = Some(Credentials::AccessToken(token));
        self
    }

    pub fn with_login(mut self, email: impl Into<String>, password: SecretString) -> Self {
        self.credentials = Some(Credentials::Login {
            email: email.into(),
            password,
        });
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Makes the first connection failure terminal.
    pub fn without_reconnect(self) -> Self {
        self.with_reconnect(ReconnectPolicy::Disabled)
    }

    pub fn with_heartbeat(mut self, heartbeat: bool) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_heartbeat_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets an explicit websocket URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.url = Some(url.trim_end().to_string());
        self
    }

    fn validate(&self) -> Result<(), RealtimeError> {
        match (self.auth_mode, &self.credentials) {
            (AuthMode::Strict, Some(Credentials::AccessToken(_))) => Ok(()),
            (AuthMode::Strict, _) => Err(RealtimeError::Configuration(
                "strict auth mode requires an access token".to_string(),
            )),
            (AuthMode::Handshake, None) => Err(RealtimeError::Configuration(
                "handshake auth mode requires credentials".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Lifecycle of the shared connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Handshaking,
    Open,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors produced by the realtime client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RealtimeError {
    /// Options are inconsistent with the requested auth mode.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The socket could not be opened or was lost for good.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A caller-supplied uid is already used by a live subscription.
    #[error("subscription uid `{0}` is already in use")]
    DuplicateSubscription(String),

    /// Error event reported by the server for one subscription.
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    /// Frame that does not follow the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON serialization or deserialization error.
    #[error("json error: {0}")]
    Json(String),
}

impl RealtimeError {
    /// Returns `true` when a reconnect attempt may fix the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<TransportError> for RealtimeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(401 | 403) => Self::Auth(err.to_string()),
            TransportError::InvalidEndpoint(_) => Self::Configuration(err.to_string()),
            other => Self::Connection(other.to_string()),
        }
    }
}

/// Application message accepted by [`RealtimeClient::send_message`].
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundMessage {
    /// Sent verbatim.
    Text(String),
    /// Serialized to JSON text before sending.
    Json(Value),
}

impl OutboundMessage {
    fn into_text(self) -> Result<String, RealtimeError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Json(value) => Ok(serde_json::to_string(&value)?),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for OutboundMessage {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Derives the websocket endpoint from a base URL.
///
/// `http` and `https` schemes map to `ws` and `wss`, and [`WEBSOCKET_PATH`] is
/// appended. An explicit URL is used as-is.
pub fn websocket_endpoint(base_url: &str, url_override: Option<&str>) -> String {
    if let Some(url) = url_override {
        return url.trim_end().to_string();
    }
    let base = base_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}{WEBSOCKET_PATH}")
}

/// Entry point for realtime subscriptions.
///
/// Cloning is cheap; every clone shares the same connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Creates a client that connects with `tokio-tungstenite`.
    pub fn new(base_url: impl AsRef<str>, options: RealtimeOptions) -> Self {
        Self::with_connector(base_url, options, TungsteniteConnector)
    }

    /// Creates a client that opens sockets through `connector`.
    pub fn with_connector<C>(base_url: impl AsRef<str>, options: RealtimeOptions, connector: C) -> Self
    where
        C: Connector,
    {
        let endpoint = websocket_endpoint(base_url.as_ref(), options.url.as_deref());
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(ClientInner {
                endpoint,
                options,
                connector: Arc::new(connector),
                shared: Mutex::new(Shared::default()),
                state_tx,
                listeners: Arc::new(EventListeners::default()),
            }),
        }
    }

    /// Websocket endpoint without any auth query parameter.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watches connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Error that moved the connection to `Closed`, if it failed for good.
    ///
    /// Cleared by the next `connect()` or an effective `disconnect()`.
    pub fn last_error(&self) -> Option<RealtimeError> {
        self.inner.lock().terminal_error.clone()
    }

    /// Opens the connection and resolves once it is usable.
    ///
    /// Idempotent: resolves immediately when already open and joins an
    /// in-flight attempt otherwise. In handshake mode "usable" means the auth
    /// acknowledgement was received.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let ready_rx = {
            let mut shared = self.inner.lock();
            match shared.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting
                | ConnectionState::Handshaking
                | ConnectionState::Reconnecting => None,
                ConnectionState::Idle | ConnectionState::Closed => {
                    self.inner.options.validate()?;
                    Some(self.inner.spawn_worker(&mut shared))
                }
            }
        };

        match ready_rx {
            Some(ready_rx) => match ready_rx.await {
                Ok(result) => result,
                Err(_) => Err(RealtimeError::Connection(
                    "connection worker stopped before the connection became usable".to_string(),
                )),
            },
            None => self.wait_until_usable().await,
        }
    }

    async fn wait_until_usable(&self) -> Result<(), RealtimeError> {
        let mut states = self.inner.state_tx.subscribe();
        loop {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Idle | ConnectionState::Closed => {
                    return Err(self.inner.closed_error());
                }
                _ => {}
            }
            if states.changed().await.is_err() {
                return Err(self.inner.closed_error());
            }
        }
    }

    /// Closes the connection and ends every subscription stream.
    ///
    /// Streams end at once; payloads still queued on them are discarded, as
    /// are queued messages. Calling this again, or after the connection
    /// already failed, is a no-op.
    pub fn disconnect(&self) {
        let drained = {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            if shared.state == ConnectionState::Closed
                && shared.worker_id.is_none()
                && shared.registry.is_empty()
            {
                return;
            }
            if let Some(commands) = shared.commands.take() {
                let _ = commands.send(WorkerCommand::Shutdown);
            }
            shared.worker_id = None;
            shared.outbox.clear();
            shared.terminal_error = None;
            let previous = shared.state;
            self.inner.set_state(shared, ConnectionState::Closed);
            let drained = shared.registry.drain();
            for entry in &drained {
                entry.end();
            }
            info!(
                event = "realtime_disconnected",
                previous_state = %previous,
                subscriptions = drained.len()
            );
            drained
        };
        drop(drained);
    }

    /// Registers a listener for raw websocket events.
    ///
    /// The returned remover unregisters exactly this listener.
    pub fn on_websocket<F>(&self, kind: WebSocketEventKind, handler: F) -> ListenerRemover
    where
        F: Fn(&WebSocketEvent) + Send + Sync + 'static,
    {
        let listeners = Arc::clone(&self.inner.listeners);
        let id = listeners.add(kind, Arc::new(handler));
        ListenerRemover::new(listeners, kind, id)
    }

    /// Sends an application message, or queues it until the connection is
    /// usable.
    pub fn send_message(&self, message: impl Into<OutboundMessage>) -> Result<(), RealtimeError> {
        let text = message.into().into_text()?;
        let mut shared = self.inner.lock();
        shared.dispatch(Outbound::message(text));
        Ok(())
    }

    /// Subscribes to changes on `collection`.
    ///
    /// The subscribe command is sent immediately when the connection is
    /// usable; otherwise it goes out when the connection opens. Items are
    /// decoded into `T`.
    pub fn subscribe<T>(
        &self,
        collection: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<Subscription<T>, RealtimeError>
    where
        T: DeserializeOwned,
    {
        let collection = collection.into();
        let ended = Arc::new(AtomicBool::new(false));
        let (uid, order, inbox) =
            self.inner.register(collection.clone(), options, Arc::clone(&ended))?;
        let unsubscriber = Unsubscriber::new(Arc::clone(&self.inner), uid.clone(), order);
        Ok(Subscription::new(uid, collection, inbox, ended, unsubscriber))
    }

    /// Live subscriptions in registration order.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.lock().registry.snapshot()
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutboundKind {
    Message,
    Subscribe,
    Unsubscribe,
}

#[derive(Clone, Debug)]
pub(crate) struct Outbound {
    text: String,
    kind: OutboundKind,
}

impl Outbound {
    fn message(text: String) -> Self {
        Self {
            text,
            kind: OutboundKind::Message,
        }
    }

    fn command(message: &ClientMessage, kind: OutboundKind) -> Result<Self, RealtimeError> {
        Ok(Self {
            text: message.to_text()?,
            kind,
        })
    }

    /// Subscription commands are rebuilt from the registry on every open, so
    /// only application messages are carried across a drop.
    fn survives_drop(&self) -> bool {
        self.kind == OutboundKind::Message
    }
}

enum WorkerCommand {
    Send(Outbound),
    Shutdown,
}

#[derive(Default)]
struct Shared {
    state: ConnectionState,
    registry: SubscriptionRegistry,
    outbox: VecDeque<Outbound>,
    commands: Option<mpsc::UnboundedSender<WorkerCommand>>,
    worker_id: Option<u64>,
    next_worker_id: u64,
    terminal_error: Option<RealtimeError>,
}

impl Shared {
    /// Hands `out` to the worker when the connection is usable. Otherwise
    /// application messages are queued and subscription commands dropped.
    fn dispatch(&mut self, out: Outbound) {
        let out = match (&self.commands, self.state) {
            (Some(commands), ConnectionState::Open) => {
                match commands.send(WorkerCommand::Send(out)) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(WorkerCommand::Send(out))) => out,
                    Err(_) => return,
                }
            }
            _ => out,
        };
        if out.survives_drop() {
            self.outbox.push_back(out);
        } else {
            debug!(event = "subscription_command_deferred", kind = ?out.kind);
        }
    }
}

pub(crate) struct ClientInner {
    endpoint: String,
    options: RealtimeOptions,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Arc<EventListeners>,
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state == state {
            return;
        }
        debug!(
            event = "connection_state_changed",
            from = %shared.state,
            to = %state
        );
        shared.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: WebSocketEvent) {
        self.listeners.emit(&event);
    }

    fn closed_error(&self) -> RealtimeError {
        self.lock()
            .terminal_error
            .clone()
            .unwrap_or_else(|| RealtimeError::Connection("connection closed".to_string()))
    }

    fn register(
        &self,
        collection: String,
        options: SubscribeOptions,
        ended: Arc<AtomicBool>,
    ) -> Result<(String, u64, mpsc::UnboundedReceiver<InboxItem>), RealtimeError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut guard = self.lock();
        let shared = &mut *guard;
        let (uid, order) = shared.registry.register(
            collection,
            options.query,
            options.event,
            options.uid,
            inbox_tx,
            ended,
        )?;

        let command = match shared.registry.get(&uid) {
            Some(entry) => Outbound::command(&entry.subscribe_command(), OutboundKind::Subscribe),
            None => Err(RealtimeError::Protocol(format!(
                "subscription {uid} vanished during registration"
            ))),
        };
        match command {
            Ok(out) => shared.dispatch(out),
            Err(err) => {
                shared.registry.remove(&uid, order);
                return Err(err);
            }
        }

        debug!(
            event = "subscription_registered",
            uid = %uid,
            state = %shared.state,
            live = shared.registry.len()
        );
        Ok((uid, order, inbox_rx))
    }

    /// Removes the registration `order` of `uid`; later calls are no-ops.
    pub(crate) fn unsubscribe(&self, uid: &str, order: u64) {
        let removed = {
            let mut guard = self.lock();
            let shared = &mut *guard;
            let removed = shared.registry.remove(uid, order);
            if let Some(entry) = &removed {
                entry.end();
                let command = ClientMessage::Unsubscribe {
                    uid: uid.to_string(),
                };
                match Outbound::command(&command, OutboundKind::Unsubscribe) {
                    Ok(out) => shared.dispatch(out),
                    Err(err) => warn!(event = "unsubscribe_encode_failed", uid, error = %err),
                }
                debug!(event = "subscription_removed", uid, live = shared.registry.len());
            }
            removed
        };
        drop(removed);
    }

    fn spawn_worker(self: &Arc<Self>, shared: &mut Shared) -> oneshot::Receiver<Result<(), RealtimeError>> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker_id = shared.next_worker_id;
        shared.next_worker_id += 1;
        shared.worker_id = Some(worker_id);
        shared.commands = Some(commands_tx);
        shared.terminal_error = None;
        self.set_state(shared, ConnectionState::Connecting);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            connection_worker(inner, worker_id, commands_rx, ready_tx).await;
        });
        ready_rx
    }

    fn connect_url(&self) -> Result<String, RealtimeError> {
        if self.options.auth_mode != AuthMode::Strict {
            return Ok(self.endpoint.clone());
        }
        match &self.options.credentials {
            Some(Credentials::AccessToken(token)) => {
                let separator = if self.endpoint.contains('?') { '&' } else { '?' };
                Ok(format!(
                    "{}{}access_token={}",
                    self.endpoint,
                    separator,
                    urlencoding::encode(token.expose_secret())
                ))
            }
            _ => Err(RealtimeError::Configuration(
                "strict auth mode requires an access token".to_string(),
            )),
        }
    }

    fn mark_handshaking(&self, worker_id: u64) {
        let mut guard = self.lock();
        let shared = &mut *guard;
        if shared.worker_id == Some(worker_id) {
            self.set_state(shared, ConnectionState::Handshaking);
        }
    }

    /// Marks the connection usable and returns what must be written first:
    /// replayed subscribe commands followed by the queued outbox.
    fn activate(&self, worker_id: u64) -> Option<Vec<Outbound>> {
        let mut guard = self.lock();
        let shared = &mut *guard;
        if shared.worker_id != Some(worker_id) {
            return None;
        }

        let mut batch = Vec::new();
        for command in shared.registry.replay_commands() {
            match Outbound::command(&command, OutboundKind::Subscribe) {
                Ok(out) => batch.push(out),
                Err(err) => warn!(event = "subscription_replay_encode_failed", error = %err),
            }
        }
        let replayed = batch.len();
        batch.extend(shared.outbox.drain(..));
        shared.terminal_error = None;
        self.set_state(shared, ConnectionState::Open);

        info!(
            event = "realtime_connection_usable",
            worker_id,
            replayed_subscriptions = replayed,
            queued_messages = batch.len() - replayed
        );
        Some(batch)
    }

    /// Puts application messages that were not written back at the head of
    /// the outbox. Returns `false` once the worker has been superseded.
    fn enter_reconnecting(
        &self,
        worker_id: u64,
        unsent: Vec<Outbound>,
        commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> bool {
        let mut guard = self.lock();
        let shared = &mut *guard;
        if shared.worker_id != Some(worker_id) {
            return false;
        }

        let mut carried: Vec<Outbound> = unsent.into_iter().filter(Outbound::survives_drop).collect();
        while let Ok(command) = commands.try_recv() {
            match command {
                WorkerCommand::Send(out) if out.survives_drop() => carried.push(out),
                WorkerCommand::Send(_) => {}
                WorkerCommand::Shutdown => return false,
            }
        }
        for out in carried.into_iter().rev() {
            shared.outbox.push_front(out);
        }
        self.set_state(shared, ConnectionState::Reconnecting);
        true
    }

    fn requeue(&self, out: Outbound) {
        if out.survives_drop() {
            self.lock().outbox.push_back(out);
        }
    }

    /// Moves to `Closed` after a fatal failure and hands `err` to every live
    /// subscription and a pending `connect`.
    fn terminate(
        &self,
        worker_id: u64,
        err: RealtimeError,
        ready_tx: &mut Option<oneshot::Sender<Result<(), RealtimeError>>>,
    ) {
        let drained = {
            let mut guard = self.lock();
            let shared = &mut *guard;
            if shared.worker_id == Some(worker_id) {
                shared.worker_id = None;
                shared.commands = None;
                shared.outbox.clear();
                shared.terminal_error = Some(err.clone());
                self.set_state(shared, ConnectionState::Closed);
                shared.registry.drain()
            } else {
                Vec::new()
            }
        };

        warn!(
            event = "realtime_connection_terminated",
            worker_id,
            error = %err,
            subscriptions = drained.len()
        );
        for entry in drained {
            let _ = entry.inbox.send(Err(err.clone()));
        }
        self.emit(WebSocketEvent::Error(err.to_string()));
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

enum SessionOutcome {
    Shutdown,
    Dropped {
        reason: RealtimeError,
        unsent: Vec<Outbound>,
    },
}

async fn connection_worker(
    inner: Arc<ClientInner>,
    worker_id: u64,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    ready_tx: oneshot::Sender<Result<(), RealtimeError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let policy = inner.options.reconnect;
    let mut retries_used: u32 = 0;

    loop {
        let outcome = run_session(
            &inner,
            worker_id,
            &mut commands,
            &mut ready_tx,
            &mut retries_used,
        )
        .await;

        let (reason, unsent) = match outcome {
            Ok(SessionOutcome::Shutdown) => {
                stop_worker(&inner, worker_id, &mut ready_tx);
                return;
            }
            Ok(SessionOutcome::Dropped { reason, unsent }) => (reason, unsent),
            Err(err) if !err.is_retryable() => {
                inner.terminate(worker_id, err, &mut ready_tx);
                return;
            }
            Err(err) => (err, Vec::new()),
        };

        let Some(delay) = policy.next_delay(retries_used) else {
            let terminal = if policy.is_enabled() {
                RealtimeError::Connection(format!(
                    "reconnect retries exhausted after {retries_used} attempts: {reason}"
                ))
            } else {
                reason
            };
            inner.terminate(worker_id, terminal, &mut ready_tx);
            return;
        };
        retries_used += 1;

        if !inner.enter_reconnecting(worker_id, unsent, &mut commands) {
            stop_worker(&inner, worker_id, &mut ready_tx);
            return;
        }
        info!(
            event = "realtime_reconnect_scheduled",
            worker_id,
            attempt = retries_used,
            delay_ms = delay.as_millis() as u64,
            reason = %reason
        );

        if !collect_messages_during_delay(&inner, delay, &mut commands).await {
            stop_worker(&inner, worker_id, &mut ready_tx);
            return;
        }
    }
}

/// Shutdown from any phase: listeners see `Close` whether or not a socket
/// was open, and a pending `connect` fails.
fn stop_worker(
    inner: &ClientInner,
    worker_id: u64,
    ready_tx: &mut Option<oneshot::Sender<Result<(), RealtimeError>>>,
) {
    debug!(event = "connection_worker_stopped", worker_id);
    inner.emit(WebSocketEvent::Close(None));
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Err(RealtimeError::Connection(
            "disconnected before the connection became usable".to_string(),
        )));
    }
}

async fn run_session(
    inner: &Arc<ClientInner>,
    worker_id: u64,
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    ready_tx: &mut Option<oneshot::Sender<Result<(), RealtimeError>>>,
    retries_used: &mut u32,
) -> Result<SessionOutcome, RealtimeError> {
    let mut socket = tokio::select! {
        biased;
        _ = wait_for_shutdown(inner, commands) => return Ok(SessionOutcome::Shutdown),
        socket = establish_socket(inner, worker_id) => socket?,
    };

    let Some(initial) = inner.activate(worker_id) else {
        close_socket(&mut socket).await;
        return Ok(SessionOutcome::Shutdown);
    };
    *retries_used = 0;
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Ok(()));
    }

    let mut pending = VecDeque::from(initial);
    while let Some(next) = pending.pop_front() {
        if let Err(err) = socket.send(Frame::Text(next.text.clone())).await {
            pending.push_front(next);
            inner.emit(WebSocketEvent::Error(err.to_string()));
            return Ok(SessionOutcome::Dropped {
                reason: err.into(),
                unsent: pending.into(),
            });
        }
    }

    let heartbeat = inner.options.heartbeat;
    let interval = inner.options.heartbeat_interval;
    let liveness_timeout = inner.options.heartbeat_timeout;
    let mut idle_deadline = Instant::now() + interval;
    let mut awaiting_liveness = false;
    let mut liveness_deadline = Instant::now() + FAR_FUTURE;

    loop {
        let idle_sleep = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(idle_sleep);
        let liveness_sleep = tokio::time::sleep_until(liveness_deadline);
        tokio::pin!(liveness_sleep);

        tokio::select! {
            biased;

            _ = &mut liveness_sleep, if heartbeat && awaiting_liveness => {
                warn!(
                    event = "heartbeat_timeout",
                    worker_id,
                    timeout_ms = liveness_timeout.as_millis() as u64
                );
                close_socket(&mut socket).await;
                inner.emit(WebSocketEvent::Close(None));
                return Ok(SessionOutcome::Dropped {
                    reason: RealtimeError::Connection("heartbeat timed out".to_string()),
                    unsent: Vec::new(),
                });
            }

            command = commands.recv() => {
                match command {
                    Some(WorkerCommand::Send(out)) => {
                        if let Err(err) = socket.send(Frame::Text(out.text.clone())).await {
                            inner.emit(WebSocketEvent::Error(err.to_string()));
                            return Ok(SessionOutcome::Dropped {
                                reason: err.into(),
                                unsent: vec![out],
                            });
                        }
                    }
                    Some(WorkerCommand::Shutdown) | None => {
                        close_socket(&mut socket).await;
                        return Ok(SessionOutcome::Shutdown);
                    }
                }
            }

            _ = &mut idle_sleep, if heartbeat && !awaiting_liveness => {
                if let Err(err) = send_client_message(&mut socket, &ClientMessage::Ping).await {
                    return Ok(SessionOutcome::Dropped { reason: err, unsent: Vec::new() });
                }
                debug!(event = "heartbeat_ping_sent", worker_id);
                awaiting_liveness = true;
                liveness_deadline = Instant::now() + liveness_timeout;
                idle_deadline = Instant::now() + interval;
            }

            frame = socket.next() => {
                idle_deadline = Instant::now() + interval;
                awaiting_liveness = false;
                liveness_deadline = Instant::now() + FAR_FUTURE;

                match frame {
                    Some(Ok(Frame::Text(text))) => {
                        if let Err(err) = handle_text(inner, &mut socket, &text).await {
                            return Ok(SessionOutcome::Dropped { reason: err, unsent: Vec::new() });
                        }
                    }
                    Some(Ok(Frame::Ping(payload))) => {
                        if let Err(err) = socket.send(Frame::Pong(payload)).await {
                            return Ok(SessionOutcome::Dropped {
                                reason: err.into(),
                                unsent: Vec::new(),
                            });
                        }
                    }
                    Some(Ok(Frame::Pong(_))) => {}
                    Some(Ok(Frame::Close(info))) => {
                        debug!(event = "socket_closed_by_peer", worker_id, close = ?info);
                        inner.emit(WebSocketEvent::Close(info));
                        return Ok(SessionOutcome::Dropped {
                            reason: RealtimeError::Connection("socket closed by peer".to_string()),
                            unsent: Vec::new(),
                        });
                    }
                    Some(Err(err)) => {
                        inner.emit(WebSocketEvent::Error(err.to_string()));
                        return Ok(SessionOutcome::Dropped {
                            reason: err.into(),
                            unsent: Vec::new(),
                        });
                    }
                    None => {
                        inner.emit(WebSocketEvent::Close(None));
                        return Ok(SessionOutcome::Dropped {
                            reason: RealtimeError::Connection("socket stream ended".to_string()),
                            unsent: Vec::new(),
                        });
                    }
                }
            }
        }
    }
}

/// Opens the socket and, in handshake mode, waits for the auth
/// acknowledgement.
async fn establish_socket(inner: &ClientInner, worker_id: u64) -> Result<BoxSocket, RealtimeError> {
    let url = inner.connect_url()?;
    debug!(
        event = "socket_connecting",
        worker_id,
        endpoint = %inner.endpoint,
        auth_mode = ?inner.options.auth_mode
    );

    let timeout = inner.options.connect_timeout;
    let mut socket = match with_timeout(timeout, inner.connector.connect(&url)).await {
        Ok(result) => result.map_err(|err| {
            inner.emit(WebSocketEvent::Error(err.to_string()));
            RealtimeError::from(err)
        })?,
        Err(_) => {
            return Err(RealtimeError::Connection(format!(
                "connect timed out after {}ms",
                timeout.as_millis()
            )));
        }
    };
    inner.emit(WebSocketEvent::Open);

    if inner.options.auth_mode != AuthMode::Handshake {
        return Ok(socket);
    }

    let Some(credentials) = inner.options.credentials.as_ref() else {
        return Err(RealtimeError::Configuration(
            "handshake auth mode requires credentials".to_string(),
        ));
    };
    inner.mark_handshaking(worker_id);
    send_client_message(&mut socket, &credentials.auth_message()).await?;

    let timeout = inner.options.handshake_timeout;
    match with_timeout(timeout, await_auth_ack(inner, &mut socket)).await {
        Ok(Ok(())) => {
            debug!(event = "auth_acknowledged", worker_id);
            Ok(socket)
        }
        Ok(Err(err)) => {
            close_socket(&mut socket).await;
            Err(err)
        }
        Err(_) => {
            close_socket(&mut socket).await;
            Err(RealtimeError::Connection(format!(
                "auth acknowledgement timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

async fn await_auth_ack(inner: &ClientInner, socket: &mut BoxSocket) -> Result<(), RealtimeError> {
    loop {
        match socket.next().await {
            Some(Ok(Frame::Text(text))) => match classify(&text) {
                Ok(Inbound::AuthOk(_)) => return Ok(()),
                Ok(Inbound::AuthRejected(detail, _)) => {
                    warn!(event = "auth_rejected", code = %detail.code);
                    return Err(RealtimeError::Auth(format!(
                        "{}: {}",
                        detail.code, detail.message
                    )));
                }
                Ok(Inbound::Ping(_)) => {
                    send_client_message(socket, &ClientMessage::Pong).await?;
                }
                Ok(_) => debug!(event = "frame_before_auth_ignored"),
                Err(err) => warn!(event = "frame_before_auth_malformed", error = %err),
            },
            Some(Ok(Frame::Ping(payload))) => socket.send(Frame::Pong(payload)).await?,
            Some(Ok(Frame::Pong(_))) => {}
            Some(Ok(Frame::Close(info))) => {
                inner.emit(WebSocketEvent::Close(info));
                return Err(RealtimeError::Connection(
                    "socket closed before auth acknowledgement".to_string(),
                ));
            }
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(RealtimeError::Connection(
                    "socket ended before auth acknowledgement".to_string(),
                ));
            }
        }
    }
}

async fn handle_text(
    inner: &ClientInner,
    socket: &mut BoxSocket,
    text: &str,
) -> Result<(), RealtimeError> {
    let inbound = match classify(text) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!(event = "inbound_frame_malformed", error = %err);
            return Ok(());
        }
    };

    match inbound {
        Inbound::Subscription(frame) => {
            let shared = inner.lock();
            route_subscription(&shared.registry, frame);
        }
        // Answered pings are consumed; without heartbeat they are ordinary frames.
        Inbound::Ping(value) => {
            if inner.options.heartbeat {
                send_client_message(socket, &ClientMessage::Pong).await?;
            } else {
                inner.emit(WebSocketEvent::Message(value));
            }
        }
        Inbound::AuthRejected(detail, value) => {
            warn!(
                event = "auth_rejected_after_open",
                code = %detail.code,
                message = %detail.message
            );
            inner.emit(WebSocketEvent::Message(value));
        }
        Inbound::AuthOk(value) | Inbound::Pong(value) | Inbound::Other(value) => {
            inner.emit(WebSocketEvent::Message(value));
        }
    }
    Ok(())
}

async fn send_client_message(
    socket: &mut BoxSocket,
    message: &ClientMessage,
) -> Result<(), RealtimeError> {
    let text = message.to_text()?;
    socket.send(Frame::Text(text)).await?;
    Ok(())
}

async fn close_socket(socket: &mut BoxSocket) {
    if with_timeout(CLOSE_TIMEOUT, socket.close()).await.is_err() {
        debug!(event = "socket_close_timed_out");
    }
}

/// Waits for a shutdown command, moving outbound items that arrive in the
/// meantime back into the shared outbox.
async fn wait_for_shutdown(
    inner: &ClientInner,
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
) {
    loop {
        match commands.recv().await {
            Some(WorkerCommand::Send(out)) => inner.requeue(out),
            Some(WorkerCommand::Shutdown) | None => return,
        }
    }
}

async fn collect_messages_during_delay(
    inner: &ClientInner,
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => {
                match command {
                    Some(WorkerCommand::Send(out)) => inner.requeue(out),
                    Some(WorkerCommand::Shutdown) | None => return false,
                }
            }
        }
    }
}
