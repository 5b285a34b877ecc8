use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast of committed store events.
///
/// Every event is published after it is durable, exactly once per commit, so
/// a subscriber that reacts to `PaymentApproved` sees each approval once even
/// when the processor delivers the notification many times.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
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
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one complex's events. Creates the channel if needed.
    pub fn subscribe(&self, complex_id: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(complex_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every complex.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, complex_id: &str, event: &Event) {
        if let Some(sender) = self.channels.get(complex_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }
}
