use tokio::sync::broadcast;

use crate::types::ChatEvent;

/// Broadcast event stream type used by host subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Fan-out channel carrying engine notifications to any number of subscribers.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Create a channel keeping up to `event_buffer` undelivered events.
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = ChatEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LifecycleState;

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let channels = ChatChannels::new(16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();
        assert_eq!(channels.subscriber_count(), 2);

        channels.emit(ChatEvent::StateChanged {
            state: LifecycleState::Idle,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_harmless() {
        let channels = ChatChannels::new(0);
        channels.emit_all([ChatEvent::Ready, ChatEvent::Ready]);

        let mut late = channels.subscribe();
        channels.emit(ChatEvent::Ready);
        assert_eq!(late.recv().await.expect("late subscriber"), ChatEvent::Ready);
    }
}
