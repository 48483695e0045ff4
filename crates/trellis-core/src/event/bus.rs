//! Broadcast event bus for distributing `RunEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op; slow subscribers observe `Lagged` and keep going.

use tokio::sync::broadcast;
use trellis_types::event::RunEvent;

/// Multi-consumer bus shared by every run of an engine.
///
/// Cloning the bus clones the sender, so all clones feed the same channel.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn started(run_id: Uuid) -> RunEvent {
        RunEvent::Started {
            run_id,
            workflow_id: "article".to_string(),
            resumed: false,
        }
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let run_id = Uuid::now_v7();

        bus.publish(started(run_id));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id(), run_id);
    }

    #[tokio::test]
    async fn test_each_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(started(Uuid::now_v7()));

        assert!(matches!(rx1.recv().await.unwrap(), RunEvent::Started { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), RunEvent::Started { .. }));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(16);
        bus.publish(started(Uuid::now_v7()));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_lagged_receiver() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(started(Uuid::now_v7()));
        }
        match rx.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();
        bus2.publish(started(Uuid::now_v7()));
        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
