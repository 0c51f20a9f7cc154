//! Best-effort fan-out of accepted changes
//!
//! Backed by a tokio broadcast channel: sending never waits on receivers, a
//! receiver that falls behind loses the oldest events (it observes
//! `RecvError::Lagged`) and late subscribers see nothing from before they
//! subscribed.

use filetracker_core::ChangeEvent;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver to every current subscriber; returns how many there were
    pub fn broadcast(&self, event: ChangeEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(e) => {
                debug!("No change subscribers for {}", e.0.path);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
