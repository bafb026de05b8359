//! Cross-context change propagation.
//!
//! Every [`Store`](crate::store::Store) attached to the same [`BroadcastHub`]
//! publishes its local changes there and applies changes published by the
//! others. Messages carry the publishing context's id so a store never
//! re-applies its own changes.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::ChangeMessage;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Uuid,
    pub message: ChangeMessage,
}

#[derive(Debug, Clone)]
pub struct BroadcastHub {
    sender: broadcast::Sender<Envelope>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a change. Returns how many contexts were listening.
    pub fn publish(&self, origin: Uuid, message: ChangeMessage) -> usize {
        // No receivers is not an error: nobody else is attached yet.
        self.sender
            .send(Envelope { origin, message })
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}
