//! Subscription registry.
//!
//! One entry per `kind:target` key, plus one entry per broadcast channel.
//! Every entry keeps the frame that opened it so the whole registry can be
//! replayed after a reconnect. Each install gets a fresh id; handles carry
//! that id and can only remove the entry they created.

use nimbus_protocol::{
    AnalyticsTarget, AnalyticsUpdate, ClientFrame, DatabaseChange, LogicEvent, WorkflowEvent,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::presence::PresenceDiff;

/// Maximum target name length.
pub const MAX_TARGET_LENGTH: usize = 256;

/// Validate a table, channel, workflow, logic or analytics name.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_target(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_TARGET_LENGTH {
        return Err("name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("name contains control characters");
    }
    Ok(())
}

/// Identifier of one installed subscription.
pub type SubscriptionId = u64;

/// Kind of keyed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKind {
    Database,
    Presence,
    Workflow,
    Logic,
    Analytics,
}

impl SubscriptionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::Database => "database",
            SubscriptionKind::Presence => "presence",
            SubscriptionKind::Workflow => "workflow",
            SubscriptionKind::Logic => "logic",
            SubscriptionKind::Analytics => "analytics",
        }
    }

    /// Parse the kind names the server uses in confirmations.
    ///
    /// Tables are reported as either `database` or `table`.
    #[must_use]
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "database" | "table" => Some(SubscriptionKind::Database),
            "presence" => Some(SubscriptionKind::Presence),
            "workflow" => Some(SubscriptionKind::Workflow),
            "logic" => Some(SubscriptionKind::Logic),
            "analytics" => Some(SubscriptionKind::Analytics),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite `kind:target` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub kind: SubscriptionKind,
    pub target: String,
}

impl SubscriptionKey {
    #[must_use]
    pub fn new(kind: SubscriptionKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }

    #[must_use]
    pub fn database(table: impl Into<String>) -> Self {
        Self::new(SubscriptionKind::Database, table)
    }

    #[must_use]
    pub fn presence(channel: impl Into<String>) -> Self {
        Self::new(SubscriptionKind::Presence, channel)
    }

    #[must_use]
    pub fn workflow(workflow_id: impl Into<String>) -> Self {
        Self::new(SubscriptionKind::Workflow, workflow_id)
    }

    #[must_use]
    pub fn logic(logic_name: impl Into<String>) -> Self {
        Self::new(SubscriptionKind::Logic, logic_name)
    }

    #[must_use]
    pub fn analytics(target: &AnalyticsTarget) -> Self {
        Self::new(SubscriptionKind::Analytics, target.route())
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)
    }
}

pub type DatabaseCallback = Arc<dyn Fn(DatabaseChange) + Send + Sync>;
pub type PresenceCallback = Arc<dyn Fn(PresenceDiff) + Send + Sync>;
pub type WorkflowCallback = Arc<dyn Fn(WorkflowEvent) + Send + Sync>;
pub type LogicCallback = Arc<dyn Fn(LogicEvent) + Send + Sync>;
pub type AnalyticsCallback = Arc<dyn Fn(AnalyticsUpdate) + Send + Sync>;
pub type ChannelCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback of a keyed subscription.
#[derive(Clone)]
pub(crate) enum Handler {
    Database(DatabaseCallback),
    Presence(PresenceCallback),
    Workflow(WorkflowCallback),
    Logic(LogicCallback),
    Analytics(AnalyticsCallback),
}

/// An inbound event addressed to a keyed subscription.
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Database(DatabaseChange),
    Presence { channel: String, diff: PresenceDiff },
    Workflow(WorkflowEvent),
    Logic(LogicEvent),
    Analytics(AnalyticsUpdate),
}

impl Delivery {
    pub(crate) fn key(&self) -> SubscriptionKey {
        match self {
            Delivery::Database(change) => SubscriptionKey::database(&change.table),
            Delivery::Presence { channel, .. } => SubscriptionKey::presence(channel),
            Delivery::Workflow(event) => SubscriptionKey::workflow(&event.workflow_id),
            Delivery::Logic(event) => SubscriptionKey::logic(&event.logic_name),
            Delivery::Analytics(update) => {
                SubscriptionKey::new(SubscriptionKind::Analytics, update.route())
            }
        }
    }
}

impl Handler {
    /// Hand `delivery` to the callback.
    ///
    /// Returns `false` if the delivery is for a different kind.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        match (self, delivery) {
            (Handler::Database(cb), Delivery::Database(change)) => cb(change),
            (Handler::Presence(cb), Delivery::Presence { diff, .. }) => cb(diff),
            (Handler::Workflow(cb), Delivery::Workflow(event)) => cb(event),
            (Handler::Logic(cb), Delivery::Logic(event)) => cb(event),
            (Handler::Analytics(cb), Delivery::Analytics(update)) => cb(update),
            _ => return false,
        }
        true
    }
}

pub(crate) struct Entry {
    pub(crate) id: SubscriptionId,
    /// Frame that opened the subscription, replayed on reconnect.
    pub(crate) subscribe: ClientFrame,
    pub(crate) handler: Handler,
    /// Cleared when the server refuses the subscription.
    pub(crate) active: bool,
}

pub(crate) struct ChannelEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) callback: ChannelCallback,
    /// As last reported by the server.
    pub(crate) subscribers: Option<u64>,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<SubscriptionKey, Entry>,
    channels: HashMap<String, ChannelEntry>,
    next_id: SubscriptionId,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl Registry {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        self.next_id
    }

    /// Install a keyed subscription, returning the entry it replaced.
    pub(crate) fn insert(
        &mut self,
        key: SubscriptionKey,
        subscribe: ClientFrame,
        handler: Handler,
    ) -> (SubscriptionId, Option<Entry>) {
        let id = self.next_id();
        debug!(key = %key, id, "Subscription installed");
        let previous = self.entries.insert(
            key,
            Entry {
                id,
                subscribe,
                handler,
                active: true,
            },
        );
        (id, previous)
    }

    /// Remove a keyed subscription.
    ///
    /// With `id`, the entry is only removed if it is still the one that id
    /// installed.
    pub(crate) fn remove(&mut self, key: &SubscriptionKey, id: Option<SubscriptionId>) -> Option<Entry> {
        match (self.entries.get(key), id) {
            (Some(entry), Some(id)) if entry.id != id => None,
            (Some(_), _) => {
                debug!(key = %key, "Subscription removed");
                self.entries.remove(key)
            }
            (None, _) => None,
        }
    }

    pub(crate) fn insert_channel(
        &mut self,
        channel: impl Into<String>,
        callback: ChannelCallback,
    ) -> (SubscriptionId, Option<ChannelEntry>) {
        let id = self.next_id();
        let channel = channel.into();
        debug!(channel = %channel, id, "Channel subscription installed");
        let previous = self.channels.insert(
            channel,
            ChannelEntry {
                id,
                callback,
                subscribers: None,
            },
        );
        (id, previous)
    }

    pub(crate) fn remove_channel(
        &mut self,
        channel: &str,
        id: Option<SubscriptionId>,
    ) -> Option<ChannelEntry> {
        match (self.channels.get(channel), id) {
            (Some(entry), Some(id)) if entry.id != id => None,
            (Some(_), _) => {
                debug!(channel = %channel, "Channel subscription removed");
                self.channels.remove(channel)
            }
            (None, _) => None,
        }
    }

    /// Handler of an active entry.
    pub(crate) fn handler(&self, key: &SubscriptionKey) -> Option<Handler> {
        self.entries
            .get(key)
            .filter(|entry| entry.active)
            .map(|entry| entry.handler.clone())
    }

    pub(crate) fn channel_callback(&self, channel: &str) -> Option<ChannelCallback> {
        self.channels
            .get(channel)
            .map(|entry| Arc::clone(&entry.callback))
    }

    pub(crate) fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.active)
    }

    /// Whether `id` still owns `key`.
    pub(crate) fn owns(&self, key: &SubscriptionKey, id: SubscriptionId) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.id == id)
    }

    pub(crate) fn owns_channel(&self, channel: &str, id: SubscriptionId) -> bool {
        self.channels.get(channel).is_some_and(|entry| entry.id == id)
    }

    /// Swap the frame replayed for an entry. Returns `false` if absent.
    pub(crate) fn set_subscribe_frame(&mut self, key: &SubscriptionKey, frame: ClientFrame) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.subscribe = frame;
                true
            }
            None => false,
        }
    }

    /// Flag an entry active or inactive. Returns `false` if absent.
    pub(crate) fn set_active(&mut self, key: &SubscriptionKey, active: bool) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_channel_subscribers(&mut self, channel: &str, subscribers: u64) -> bool {
        match self.channels.get_mut(channel) {
            Some(entry) => {
                entry.subscribers = Some(subscribers);
                true
            }
            None => false,
        }
    }

    pub(crate) fn channel_subscribers(&self, channel: &str) -> Option<u64> {
        self.channels.get(channel).and_then(|entry| entry.subscribers)
    }

    /// `kind:target` of every active entry, sorted.
    pub(crate) fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<&SubscriptionKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys.into_iter().map(ToString::to_string).collect()
    }

    /// Subscribed channel names, sorted.
    pub(crate) fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Frames that reopen every active entry and every channel.
    pub(crate) fn replay(&self) -> Vec<(String, ClientFrame)> {
        let mut frames: Vec<(String, ClientFrame)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(key, entry)| (key.to_string(), entry.subscribe.clone()))
            .collect();
        frames.extend(self.channels.keys().map(|channel| {
            (
                format!("channel:{channel}"),
                ClientFrame::subscribe_channel(channel.as_str()),
            )
        }));
        frames.sort_by(|a, b| a.0.cmp(&b.0));
        frames
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len() + self.channels.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.channels.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_protocol::{ChangeType, TableSubscription};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Handler {
        Handler::Database(Arc::new(|_| {}))
    }

    fn table_frame(table: &str) -> ClientFrame {
        ClientFrame::subscribe_table(TableSubscription::new(table))
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("orders").is_ok());
        assert!(validate_target("room:lobby").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target(&"x".repeat(300)).is_err());
        assert!(validate_target("bad\nname").is_err());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SubscriptionKey::database("orders").to_string(), "database:orders");
        let target = AnalyticsTarget::new("dashboard", "main");
        assert_eq!(
            SubscriptionKey::analytics(&target).to_string(),
            "analytics:dashboard:main"
        );
    }

    #[test]
    fn test_insert_replaces_previous() {
        let mut registry = Registry::default();
        let key = SubscriptionKey::database("orders");

        let (first, previous) = registry.insert(key.clone(), table_frame("orders"), noop());
        assert!(previous.is_none());

        let (second, previous) = registry.insert(key.clone(), table_frame("orders"), noop());
        assert_eq!(previous.map(|entry| entry.id), Some(first));
        assert_ne!(first, second);
        assert_eq!(registry.active_keys(), vec!["database:orders"]);
    }

    #[test]
    fn test_stale_id_does_not_remove_replacement() {
        let mut registry = Registry::default();
        let key = SubscriptionKey::database("orders");

        let (stale, _) = registry.insert(key.clone(), table_frame("orders"), noop());
        let (current, _) = registry.insert(key.clone(), table_frame("orders"), noop());

        assert!(registry.remove(&key, Some(stale)).is_none());
        assert!(registry.owns(&key, current));
        assert!(registry.remove(&key, Some(current)).is_some());
        assert!(registry.remove(&key, None).is_none());
    }

    #[test]
    fn test_replay_keeps_original_frames() {
        let mut registry = Registry::default();
        let subscription = TableSubscription::new("orders")
            .with_events([ChangeType::Insert])
            .with_filter(json!({"status": "open"}));
        let frame = ClientFrame::subscribe_table(subscription);

        registry.insert(SubscriptionKey::database("orders"), frame.clone(), noop());
        registry.insert_channel("news", Arc::new(|_| {}));

        let refused = SubscriptionKey::workflow("wf-1");
        registry.insert(
            refused.clone(),
            ClientFrame::SubscribeWorkflow {
                workflow_id: "wf-1".into(),
            },
            noop(),
        );
        registry.set_active(&refused, false);

        let replay = registry.replay();
        assert_eq!(
            replay,
            vec![
                ("channel:news".to_string(), ClientFrame::subscribe_channel("news")),
                ("database:orders".to_string(), frame),
            ]
        );
    }

    #[test]
    fn test_handler_kind_mismatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = Handler::Workflow(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let event = WorkflowEvent {
            workflow_id: "wf-1".into(),
            event_type: "completed".into(),
            data: Value::Null,
            timestamp: None,
        };
        assert!(handler.deliver(Delivery::Workflow(event)));

        let change = DatabaseChange {
            change_type: ChangeType::Insert,
            table: "orders".into(),
            record: json!({"id": 1}),
            old_record: None,
        };
        assert!(!handler.deliver(Delivery::Database(change)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_subscribers() {
        let mut registry = Registry::default();
        let (id, _) = registry.insert_channel("news", Arc::new(|_| {}));
        assert!(registry.set_channel_subscribers("news", 4));
        assert_eq!(registry.channel_subscribers("news"), Some(4));
        assert!(!registry.set_channel_subscribers("sports", 1));

        assert!(registry.owns_channel("news", id));
        assert!(registry.remove_channel("news", Some(id + 1)).is_none());
        assert!(registry.remove_channel("news", Some(id)).is_some());
        assert!(registry.is_empty());
    }
}
