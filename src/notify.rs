use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub feeding live calendar views: one channel per equipment,
/// carrying every event the engine applies.
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

    /// Subscribe to events for an equipment. Creates the channel if needed.
    pub fn subscribe(&self, equipment_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(equipment_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is watching this equipment.
    pub fn send(&self, equipment_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&equipment_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a channel (e.g. when equipment is deleted).
    pub fn remove(&self, equipment_id: &Ulid) {
        self.channels.remove(equipment_id);
    }
}
