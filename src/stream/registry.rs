//! Live subscription table shared by the client handle and the worker.
//!
//! Entries are keyed by uid and remember their registration order so the
//! worker can replay subscribe commands in the order callers issued them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::stream::client::RealtimeError;
use crate::stream::proto::{ClientMessage, SubscriptionEvent, SubscriptionPayload};

/// Item pushed into a subscription inbox.
pub(crate) type InboxItem = Result<SubscriptionPayload<Value>, RealtimeError>;

/// Public snapshot of a registered subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionInfo {
    /// Correlation identifier shared with the server.
    pub uid: String,
    /// Collection the subscription watches.
    pub collection: String,
    /// Opaque query sent with the subscribe command.
    pub query: Option<Value>,
    /// Event filter, `None` meaning every kind.
    pub event: Option<SubscriptionEvent>,
}

pub(crate) struct SubscriptionEntry {
    pub(crate) uid: String,
    pub(crate) collection: String,
    pub(crate) query: Option<Value>,
    pub(crate) event: Option<SubscriptionEvent>,
    /// Registration sequence; also tells handles apart when a uid is reused.
    pub(crate) order: u64,
    pub(crate) inbox: mpsc::UnboundedSender<InboxItem>,
    /// Shared with the stream handle; once set, queued items are discarded.
    pub(crate) ended: Arc<AtomicBool>,
}

impl SubscriptionEntry {
    /// Ends the caller's stream immediately, even with items still queued.
    /// Dropping the entry afterwards wakes a parked receiver.
    pub(crate) fn end(&self) {
        self.ended.store(true, Ordering::Release);
    }

    pub(crate) fn subscribe_command(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            collection: self.collection.clone(),
            uid: self.uid.clone(),
            query: self.query.clone(),
            event: self.event,
        }
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            uid: self.uid.clone(),
            collection: self.collection.clone(),
            query: self.query.clone(),
            event: self.event,
        }
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
    next_order: u64,
    next_uid: u64,
}

impl SubscriptionRegistry {
    /// Registers a subscription and returns its uid and registration order.
    ///
    /// A caller-supplied uid that is already live fails with
    /// [`RealtimeError::DuplicateSubscription`]; generated uids skip any
    /// value currently taken.
    pub(crate) fn register(
        &mut self,
        collection: String,
        query: Option<Value>,
        event: Option<SubscriptionEvent>,
        uid: Option<String>,
        inbox: mpsc::UnboundedSender<InboxItem>,
        ended: Arc<AtomicBool>,
    ) -> Result<(String, u64), RealtimeError> {
        let uid = match uid {
            Some(uid) if self.entries.contains_key(&uid) => {
                return Err(RealtimeError::DuplicateSubscription(uid));
            }
            Some(uid) => uid,
            None => self.generate_uid(),
        };

        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(
            uid.clone(),
            SubscriptionEntry {
                uid: uid.clone(),
                collection,
                query,
                event,
                order,
                inbox,
                ended,
            },
        );
        Ok((uid, order))
    }

    fn generate_uid(&mut self) -> String {
        loop {
            let candidate = self.next_uid.to_string();
            self.next_uid += 1;
            if !self.entries.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn get(&self, uid: &str) -> Option<&SubscriptionEntry> {
        self.entries.get(uid)
    }

    /// Removes `uid` if it still belongs to the registration `order`.
    pub(crate) fn remove(&mut self, uid: &str, order: u64) -> Option<SubscriptionEntry> {
        match self.entries.get(uid) {
            Some(entry) if entry.order == order => self.entries.remove(uid),
            _ => None,
        }
    }

    /// Subscribe commands for every live entry, oldest registration first.
    pub(crate) fn replay_commands(&self) -> Vec<ClientMessage> {
        let mut entries: Vec<&SubscriptionEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.order);
        entries
            .into_iter()
            .map(SubscriptionEntry::subscribe_command)
            .collect()
    }

    /// Empties the registry, oldest registration first.
    pub(crate) fn drain(&mut self) -> Vec<SubscriptionEntry> {
        let mut entries: Vec<SubscriptionEntry> =
            self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.order);
        entries
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut entries: Vec<&SubscriptionEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.order);
        entries.into_iter().map(SubscriptionEntry::info).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::SubscriptionRegistry;
    use crate::stream::client::RealtimeError;
    use crate::stream::proto::{ClientMessage, SubscriptionEvent};

    fn register(
        registry: &mut SubscriptionRegistry,
        collection: &str,
        uid: Option<&str>,
    ) -> Result<(String, u64), RealtimeError> {
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(
            collection.to_string(),
            None,
            None,
            uid.map(str::to_string),
            tx,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn generated_uids_are_unique_and_skip_taken_values() {
        let mut registry = SubscriptionRegistry::default();
        register(&mut registry, "messages", Some("1")).expect("explicit uid");

        let mut seen = HashSet::new();
        seen.insert("1".to_string());
        for _ in 0..5 {
            let (uid, _) = register(&mut registry, "messages", None).expect("generated uid");
            assert!(seen.insert(uid), "uid reused while live");
        }
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn duplicate_explicit_uid_is_rejected() {
        let mut registry = SubscriptionRegistry::default();
        register(&mut registry, "messages", Some("x")).expect("first");
        let err = register(&mut registry, "articles", Some("x")).expect_err("duplicate");
        assert!(matches!(err, RealtimeError::DuplicateSubscription(uid) if uid == "x"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_order_does_not_remove_reused_uid() {
        let mut registry = SubscriptionRegistry::default();
        let (uid, first_order) = register(&mut registry, "messages", Some("x")).expect("first");
        assert!(registry.remove(&uid, first_order).is_some());

        let (_, second_order) = register(&mut registry, "messages", Some("x")).expect("reuse");
        assert!(registry.remove("x", first_order).is_none());
        assert!(registry.get("x").is_some());
        assert!(registry.remove("x", second_order).is_some());
        assert!(registry.remove("x", second_order).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn replay_keeps_registration_order_and_uids() {
        let mut registry = SubscriptionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry
            .register(
                "b".to_string(),
                Some(json!({"limit": 1})),
                Some(SubscriptionEvent::Create),
                Some("zz".to_string()),
                tx,
                Arc::new(AtomicBool::new(false)),
            )
            .expect("first");
        register(&mut registry, "a", Some("aa")).expect("second");
        register(&mut registry, "c", None).expect("third");

        let uids: Vec<String> = registry
            .replay_commands()
            .into_iter()
            .map(|command| match command {
                ClientMessage::Subscribe { uid, .. } => uid,
                other => panic!("unexpected command {other:?}"),
            })
            .collect();
        assert_eq!(uids[0], "zz");
        assert_eq!(uids[1], "aa");
        assert_eq!(uids.len(), 3);

        let first = &registry.replay_commands()[0];
        assert_eq!(
            first,
            &ClientMessage::Subscribe {
                collection: "b".to_string(),
                uid: "zz".to_string(),
                query: Some(json!({"limit": 1})),
                event: Some(SubscriptionEvent::Create),
            }
        );
    }

    #[test]
    fn drain_empties_in_registration_order() {
        let mut registry = SubscriptionRegistry::default();
        register(&mut registry, "one", Some("b")).expect("first");
        register(&mut registry, "two", Some("a")).expect("second");

        let drained: Vec<String> = registry.drain().into_iter().map(|entry| entry.uid).collect();
        assert_eq!(drained, vec!["b".to_string(), "a".to_string()]);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
