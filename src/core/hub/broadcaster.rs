use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;

use super::registry::ConnectionRegistry;
use crate::core::events::{PlaybackEvent, ServerMessage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn publish(&self, event: &PlaybackEvent) -> PublishReport {
        let mut report = PublishReport::default();
        for (id, outbound) in self.registry.subscribers(&event.room_id) {
            let message = ServerMessage::Playback {
                event: event.clone(),
            };
            match outbound.try_send(message) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "subscriber {id} in room {} is not keeping up; disconnecting",
                        event.room_id
                    );
                    self.registry.remove(id);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    self.registry.remove(id);
                    report.dropped += 1;
                }
            }
        }

        log::debug!(
            "published {} to room {} ({} delivered, {} dropped)",
            event.event_type.as_str(),
            event.room_id,
            report.delivered,
            report.dropped
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::core::events::PlaybackEventType;
    use crate::core::room::directory::{InMemoryDirectory, Principal};
    use crate::core::room::state::RoomSnapshot;

    fn setup() -> Broadcaster {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.create_room("lobby", Principal::new("admin"));
        Broadcaster::new(Arc::new(ConnectionRegistry::new(directory)))
    }

    fn stopped_event(room_id: &str) -> PlaybackEvent {
        PlaybackEvent::new(
            PlaybackEventType::PlaybackStopped,
            RoomSnapshot::idle(room_id, 42),
        )
    }

    #[test]
    fn publishing_to_an_empty_room_is_a_no_op() {
        let broadcaster = setup();
        assert_eq!(broadcaster.publish(&stopped_event("lobby")), PublishReport::default());
    }

    #[test]
    fn stalled_subscriber_is_dropped_without_affecting_others() {
        let broadcaster = setup();
        let registry = broadcaster.registry();

        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let fast = registry.register(fast_tx);
        let slow = registry.register(slow_tx);
        for (id, user) in [(fast, "fast"), (slow, "slow")] {
            registry.authenticate(id, Principal::new(user)).expect("auth");
            registry.join(id, "lobby").expect("join");
        }

        let first = broadcaster.publish(&stopped_event("lobby"));
        assert_eq!(first, PublishReport { delivered: 2, dropped: 0 });
        let second = broadcaster.publish(&stopped_event("lobby"));
        assert_eq!(second, PublishReport { delivered: 1, dropped: 1 });

        assert_eq!(registry.subscriber_count("lobby"), 1);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn closed_subscriber_is_removed() {
        let broadcaster = setup();
        let registry = broadcaster.registry();
        let (tx, rx) = mpsc::channel(4);
        let id = registry.register(tx);
        registry.authenticate(id, Principal::new("gone")).expect("auth");
        registry.join(id, "lobby").expect("join");
        drop(rx);

        let report = broadcaster.publish(&stopped_event("lobby"));
        assert_eq!(report, PublishReport { delivered: 0, dropped: 1 });
        assert_eq!(registry.connection_count(), 0);
    }
}
