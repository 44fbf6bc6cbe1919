use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per teacher or student.
/// Delivery (email, push) belongs to whoever subscribes.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a teacher or student. Creates the channel if needed.
    pub fn subscribe(&self, owner_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, owner_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&owner_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a channel once its last subscriber has gone.
    pub fn remove(&self, owner_id: &Ulid) {
        self.channels
            .remove_if(owner_id, |_, sender| sender.receiver_count() == 0);
    }
}
