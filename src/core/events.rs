//! Typed event channels.
//!
//! Every variable and calculation element owns a [`ValueNotifier`];
//! every device owns a [`RefreshNotifier`]. Events are posted
//! synchronously (the send itself never awaits), so the consumers of a
//! refresh batch observe it atomically. Delivery is best-effort: with no
//! live subscriber the event is dropped.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::value::Value;

/// Default broadcast channel capacity.
const CHANNEL_CAPACITY: usize = 64;

/// Notification that an entity's value changed.
#[derive(Debug, Clone, Serialize)]
pub struct ValueChanged {
    /// Id of the variable or calculation element.
    pub entity_id: String,

    /// Entity name at the time of the change.
    pub name: String,

    /// The new value.
    pub value: Value,

    /// When the change was recorded.
    pub timestamp: DateTime<Utc>,
}

/// One fresh sample inside a [`Refreshed`] notification.
#[derive(Debug, Clone, Serialize)]
pub struct ChangedSample {
    /// Variable name.
    pub name: String,

    /// Decoded value at this tick.
    pub value: Value,

    /// Whether a historian should record this variable.
    pub archived: bool,

    /// Sampling period for historized snapshots, in ticks.
    pub archive_tick_id: u64,
}

/// Notification emitted once per successful device refresh.
///
/// Carries every variable touched by the tick's request batch, keyed by
/// variable id, so a historian can persist the whole batch under one
/// tick number.
#[derive(Debug, Clone, Serialize)]
pub struct Refreshed {
    /// Id of the refreshed device.
    pub device_id: String,

    /// Tick number the batch was sampled at.
    pub tick: u64,

    /// Touched variables keyed by id.
    pub changed: HashMap<String, ChangedSample>,

    /// When the refresh completed.
    pub timestamp: DateTime<Utc>,
}

/// Receiver half for value-changed events.
pub type ValueReceiver = broadcast::Receiver<ValueChanged>;

/// Receiver half for refreshed events.
pub type RefreshReceiver = broadcast::Receiver<Refreshed>;

/// Per-entity value-changed channel.
///
/// Cloning the notifier preserves channel identity: subscribers of the
/// original keep receiving through the clone. Entity edits rely on this
/// to reconstruct an instance without dropping its subscribers.
#[derive(Debug, Clone)]
pub struct ValueNotifier {
    sender: broadcast::Sender<ValueChanged>,
}

impl ValueNotifier {
    /// Create a new channel with the default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> ValueReceiver {
        self.sender.subscribe()
    }

    /// Post a change notification. Dropped when nobody listens.
    pub fn post(&self, entity_id: &str, name: &str, value: Value) {
        let _ = self.sender.send(ValueChanged {
            entity_id: entity_id.to_string(),
            name: name.to_string(),
            value,
            timestamp: Utc::now(),
        });
    }

    /// Check whether the two notifiers share one underlying channel.
    pub fn same_channel(&self, other: &ValueNotifier) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

impl Default for ValueNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-device refreshed channel.
#[derive(Debug, Clone)]
pub struct RefreshNotifier {
    sender: broadcast::Sender<Refreshed>,
}

impl RefreshNotifier {
    /// Create a new channel with the default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to refresh notifications.
    pub fn subscribe(&self) -> RefreshReceiver {
        self.sender.subscribe()
    }

    /// Post a refresh notification. Dropped when nobody listens.
    pub fn post(&self, device_id: &str, tick: u64, changed: HashMap<String, ChangedSample>) {
        let _ = self.sender.send(Refreshed {
            device_id: device_id.to_string(),
            tick,
            changed,
            timestamp: Utc::now(),
        });
    }
}

impl Default for RefreshNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_value_notifier_delivers() {
        let notifier = ValueNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.post("v1", "current", Value::Float(4.2));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_id, "v1");
        assert_eq!(event.name, "current");
        assert_eq!(event.value, Value::Float(4.2));
    }

    #[test]
    fn test_post_without_subscribers_is_silent() {
        let notifier = ValueNotifier::new();
        notifier.post("v1", "current", Value::Bool(true));
    }

    #[tokio::test]
    async fn test_clone_preserves_channel_identity() {
        let notifier = ValueNotifier::new();
        let mut rx = notifier.subscribe();

        let cloned = notifier.clone();
        assert!(notifier.same_channel(&cloned));

        cloned.post("v1", "current", Value::Integer(7));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.value, Value::Integer(7));
    }

    #[tokio::test]
    async fn test_refresh_notifier_delivers_batch() {
        let notifier = RefreshNotifier::new();
        let mut rx = notifier.subscribe();

        let mut changed = HashMap::new();
        changed.insert(
            "v1".to_string(),
            ChangedSample {
                name: "voltage".to_string(),
                value: Value::Float(230.0),
                archived: true,
                archive_tick_id: 10,
            },
        );
        notifier.post("dev1", 30, changed);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.device_id, "dev1");
        assert_eq!(event.tick, 30);
        assert_eq!(event.changed.len(), 1);
    }
}
