//! Broadcast fan-out for `CceEvent`, grounded in the teacher's heartbeat
//! broadcast channel: one sender, any number of subscribers (a UI, a log
//! sink, a metrics exporter), none of which can block a turn by being slow
//! or absent. A lagging subscriber drops older events rather than stalling
//! the publisher.

use cce_schema::CceEvent;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    sender: broadcast::Sender<CceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CceEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns silently if there are no subscribers;
    /// a send with no receivers is not an error worth surfacing to a turn.
    pub fn publish(&self, event: CceEvent) {
        if self.sender.send(event.clone()).is_err() {
            trace!(session_id = %event.session_id(), "published event with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(CceEvent::SessionSaved { session_id: "s1".into() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(CceEvent::SessionSaved { session_id: "s1".into() });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_the_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(CceEvent::ContextWarning { session_id: "s1".into(), usage: 0.72 });

        assert_eq!(rx1.recv().await.unwrap().session_id(), "s1");
        assert_eq!(rx2.recv().await.unwrap().session_id(), "s1");
    }
}
