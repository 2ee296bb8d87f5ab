// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Adjacency event publishing.

use crate::NeighborEvent;

/// Fan-out channel for adjacency events.
///
/// Downstream consumers (route computation, topology flooding) subscribe
/// and receive every UP/DOWN/RESTARTING/RESTARTED/RTT_CHANGE event. A slow
/// or absent subscriber never blocks the engine; it just misses events.
#[derive(Clone)]
pub struct EventPublisher {
    event_tx: tokio::sync::broadcast::Sender<NeighborEvent>,
}

impl EventPublisher {
    pub fn new(buffer_size: usize) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(buffer_size);
        Self { event_tx }
    }

    /// Get a new receiver for subscribing to events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NeighborEvent> {
        self.event_tx.subscribe()
    }

    /// Send an event to all subscribers. Returns the number of receivers
    /// that got it; zero subscribers is not an error.
    pub fn publish(&self, event: NeighborEvent) -> usize {
        self.event_tx.send(event).unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        // Sized for full-mesh flaps without drops.
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NeighborEventType, NeighborInfo};

    fn event() -> NeighborEvent {
        NeighborEvent {
            event_type: NeighborEventType::NeighborUp,
            if_name: "eth0".to_string(),
            neighbor: NeighborInfo {
                node_name: "node-2".to_string(),
                domain_name: "dc1".to_string(),
                remote_if_name: "eth9".to_string(),
                area: "0".to_string(),
                transport_address_v4: None,
                transport_address_v6: Some("fe80::2".parse().unwrap()),
                kvstore_port: 60001,
                ctrl_port: 2018,
            },
            rtt_us: 1000,
            label: 50002,
            support_flood_optimization: true,
            area: "0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let publisher = EventPublisher::default();
        let mut rx = publisher.subscribe();
        assert_eq!(publisher.publish(event()), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, NeighborEventType::NeighborUp);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::default();
        assert_eq!(publisher.publish(event()), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let publisher = EventPublisher::default();
        let mut rx1 = publisher.subscribe();
        let mut rx2 = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);
        assert_eq!(publisher.publish(event()), 2);
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
