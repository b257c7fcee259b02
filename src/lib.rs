//! Rust SDK for realtime collection subscriptions.
//!
//! Many subscriptions are multiplexed over one websocket connection. The
//! crate is organized by concern:
//! - `stream`: websocket client, subscriptions, routing, and wire types.
//! - `retry`: reconnect policy and timeout utilities.

/// Reconnect policy and timeout helpers.
pub mod retry;
/// Realtime websocket client, subscriptions, and protocol types.
pub mod stream;

pub use retry::ReconnectPolicy;
pub use stream::client::{
    AuthMode, ConnectionState, Credentials, OutboundMessage, RealtimeClient, RealtimeError,
    RealtimeOptions,
};
pub use stream::proto::{ItemId, PayloadKind, SubscriptionEvent, SubscriptionPayload};
pub use stream::registry::SubscriptionInfo;
pub use stream::router::{ListenerRemover, WebSocketEvent, WebSocketEventKind};
pub use stream::session::{SubscribeOptions, Subscription, Unsubscriber};
