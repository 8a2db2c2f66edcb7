//! Fan-out of provider events to subscribers.
//!
//! Every [`EventHub::subscribe`] call gets its own ordered channel, so
//! registering a second consumer never silently replaces the first one.
//! Dropping the [`EventSubscription`] unsubscribes.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::VoiceEvent;

#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<VoiceEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventSubscription { rx }
    }

    /// Deliver to every live subscriber, pruning dropped ones. Never blocks.
    pub fn publish(&self, event: VoiceEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Ordered stream of events from one client.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<VoiceEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<VoiceEvent> {
        self.rx.recv().await
    }
}
