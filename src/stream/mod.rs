//! Realtime subscription modules.
//!
//! - `client`: connection manager, outbound queue, and reconnect handling.
//! - `proto`: wire messages exchanged with the realtime endpoint.
//! - `registry`: live subscription table used for routing and replay.
//! - `router`: inbound frame classification and websocket listeners.
//! - `session`: typed per-subscription event streams.
//! - `transport`: socket abstraction and the default websocket connector.

/// Websocket connection manager and outbound sender.
pub mod client;
/// Realtime protocol messages.
pub mod proto;
/// Subscription table keyed by uid.
pub mod registry;
/// Inbound routing and raw websocket listeners.
pub mod router;
/// Subscription handles and their event streams.
pub mod session;
/// Socket and connector traits.
pub mod transport;
