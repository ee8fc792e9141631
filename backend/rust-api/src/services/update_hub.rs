use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::models::UpdateEvent;

const CHANNEL_CAPACITY: usize = 64;

/// Per-attempt broadcast channels for push subscribers.
///
/// Channels are created on first subscribe and dropped once a publish finds
/// no receivers left.
#[derive(Debug, Default)]
pub struct UpdateHub {
    channels: DashMap<String, broadcast::Sender<UpdateEvent>>,
}

impl UpdateHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, attempt_id: &str) -> broadcast::Receiver<UpdateEvent> {
        self.channels
            .entry(attempt_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, attempt_id: &str, event: UpdateEvent) -> usize {
        let Some(sender) = self.channels.get(attempt_id).map(|s| s.value().clone()) else {
            return 0;
        };

        match sender.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                self.channels
                    .remove_if(attempt_id, |_, s| s.receiver_count() == 0);
                0
            }
        }
    }
}
