//! Event bus
//!
//! Fan-out of session and metric events to operator clients over the
//! `/ws` endpoint. Delivery is best-effort, at-most-once: a lagging
//! subscriber loses frames and is expected to reconcile by re-fetching
//! the authoritative APIs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Rooms a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Room {
    Metrics,
    Settings,
    Streams,
}

/// One frame on the bus, exactly as serialized to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub room: Room,
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub mod names {
    pub const SESSION_STARTED: &str = "session:started";
    pub const SESSION_ENDED: &str = "session:ended";
    pub const MONITORING_UPDATE: &str = "monitoring:update";
    pub const BANDWIDTH_UPDATE: &str = "streams:bandwidth:update";
    pub const METRICS_UPDATE: &str = "metrics:update";
    pub const SETTINGS_UPDATED: &str = "settings:updated";
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to everyone currently subscribed. Nobody listening is fine.
    pub fn publish(&self, room: Room, event: &str, data: serde_json::Value) {
        let _ = self.tx.send(BusEvent {
            room,
            event: event.to_string(),
            data,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers_with_room_tag() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            Room::Streams,
            names::SESSION_STARTED,
            serde_json::json!({"sessionId": "s1"}),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.room, Room::Streams);
        assert_eq!(event.event, names::SESSION_STARTED);
        assert_eq!(event.data["sessionId"], "s1");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(Room::Metrics, names::METRICS_UPDATE, serde_json::json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn frames_serialize_for_the_wire() {
        let event = BusEvent {
            room: Room::Settings,
            event: names::SETTINGS_UPDATED.to_string(),
            data: serde_json::json!({"changed": ["device.name"]}),
            timestamp: Utc::now(),
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["room"], "settings");
        assert_eq!(wire["event"], "settings:updated");
    }
}
