//! Per-subscription event streams.
//!
//! A [`Subscription`] yields the payloads routed to its uid, decoded into the
//! caller's item type. The stream ends as soon as it is unsubscribed or the
//! client disconnects, dropping anything still queued. When the connection
//! fails for good it ends after a single error item.

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::stream::client::{ClientInner, RealtimeError};
use crate::stream::proto::{SubscriptionEvent, SubscriptionPayload};
use crate::stream::registry::InboxItem;

/// Options for [`crate::stream::client::RealtimeClient::subscribe`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Only deliver this kind of change. Init payloads are always delivered.
    pub event: Option<SubscriptionEvent>,
    /// Opaque query forwarded with the subscribe command.
    pub query: Option<Value>,
    /// Explicit uid; generated when unset.
    pub uid: Option<String>,
}

impl SubscribeOptions {
    pub fn with_event(mut self, event: SubscriptionEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_query(mut self, query: Value) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }
}

/// Live subscription to one collection.
///
/// Dropping the handle unsubscribes.
pub struct Subscription<T = Value> {
    uid: String,
    collection: String,
    inbox: mpsc::UnboundedReceiver<InboxItem>,
    ended: Arc<AtomicBool>,
    unsubscriber: Unsubscriber,
    _item: PhantomData<fn() -> T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        uid: String,
        collection: String,
        inbox: mpsc::UnboundedReceiver<InboxItem>,
        ended: Arc<AtomicBool>,
        unsubscriber: Unsubscriber,
    ) -> Self {
        Self {
            uid,
            collection,
            inbox,
            ended,
            unsubscriber,
            _item: PhantomData,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Removes the subscription. A pending [`Subscription::recv`] then
    /// resolves to `None`. Safe to call more than once.
    pub fn unsubscribe(&self) {
        self.unsubscriber.unsubscribe();
    }

    /// Returns a handle that can unsubscribe from another task.
    pub fn unsubscriber(&self) -> Unsubscriber {
        self.unsubscriber.clone()
    }
}

impl<T> Subscription<T>
where
    T: DeserializeOwned,
{
    /// Receives the next payload.
    ///
    /// Returns `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Result<SubscriptionPayload<T>, RealtimeError>> {
        StreamExt::next(self).await
    }
}

impl<T> Stream for Subscription<T>
where
    T: DeserializeOwned,
{
    type Item = Result<SubscriptionPayload<T>, RealtimeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.ended.load(Ordering::Acquire) {
                return Poll::Ready(None);
            }
            match this.inbox.poll_recv(cx) {
                Poll::Ready(Some(Ok(payload))) => {
                    if let Some(decoded) = decode(&this.uid, payload) {
                        return Poll::Ready(Some(Ok(decoded)));
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn decode<T>(uid: &str, payload: SubscriptionPayload<Value>) -> Option<SubscriptionPayload<T>>
where
    T: DeserializeOwned,
{
    let kind = payload.kind();
    match payload.try_map(serde_json::from_value::<T>) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(
                event = "subscription_payload_decode_failed",
                uid,
                kind = ?kind,
                error = %err
            );
            None
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscriber.unsubscribe();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("uid", &self.uid)
            .field("collection", &self.collection)
            .finish()
    }
}

/// Cloneable handle that removes one subscription.
#[derive(Clone)]
pub struct Unsubscriber {
    inner: Arc<ClientInner>,
    uid: String,
    order: u64,
}

impl Unsubscriber {
    pub(crate) fn new(inner: Arc<ClientInner>, uid: String, order: u64) -> Self {
        Self { inner, uid, order }
    }

    /// Removes the subscription it was created for. Later calls, and calls
    /// after the uid was reused by a new subscription, do nothing.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe(&self.uid, self.order);
    }
}

impl fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscriber").field("uid", &self.uid).finish()
    }
}
