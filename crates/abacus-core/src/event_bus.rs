use tokio::sync::broadcast;

use abacus_types::ChatEvent;

pub const EVENT_CHANNEL_CAPACITY: usize = 2048;

/// Broadcast channel for turn lifecycle events. Purely a notification
/// surface: publishing never blocks and a missing audience is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
