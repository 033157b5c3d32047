//! In-process event bus.
//!
//! Order inserts, gate flips, menu edits, and alert signals are published
//! here and fanned out to every subscriber: the SSE stream feeding open
//! browser tabs and the admin alert engine. Payloads are deliberately
//! compact; consumers that need authoritative state refetch it from the
//! store instead of trusting the event body.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default buffer for slow subscribers. A lagging SSE client drops old
/// events and resubscribes; nothing here is a source of truth.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusEvent {
    #[serde(rename_all = "camelCase")]
    OrderCreated {
        order_id: String,
        order_number: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderStatusUpdated { order_id: String, status: String },
    #[serde(rename_all = "camelCase")]
    OrderAcknowledged { order_id: String },
    #[serde(rename_all = "camelCase")]
    PickupGateChanged { enabled: bool },
    #[serde(rename_all = "camelCase")]
    MenuItemChanged {
        item_id: String,
        is_available: bool,
    },
    /// One audible alert in a bounded repeat sequence (`play` of `of`).
    #[serde(rename_all = "camelCase")]
    AlertSignal { play: u32, of: u32 },
}

/// Cloneable handle to the broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having zero subscribers is normal (no admin tab
    /// open), so send errors are ignored.
    pub fn publish(&self, event: BusEvent) {
        trace!(?event, "publishing bus event");
        let _ = self.tx.send(event);
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
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(BusEvent::PickupGateChanged { enabled: false });

        match rx1.recv().await.expect("rx1 event") {
            BusEvent::PickupGateChanged { enabled } => assert!(!enabled),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx2.recv().await.expect("rx2 event") {
            BusEvent::PickupGateChanged { enabled } => assert!(!enabled),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(BusEvent::OrderAcknowledged {
            order_id: "o1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(BusEvent::OrderCreated {
            order_id: "o1".into(),
            order_number: "TSO-X-1".into(),
        })
        .expect("serialize");
        assert_eq!(json["type"], "orderCreated");
        assert_eq!(json["orderNumber"], "TSO-X-1");
    }
}
