//! Channel-backed monitor for tests and embedding applications.

use std::sync::{Mutex, mpsc};
use std::time::Duration;

use crate::event::EngineEvent;
use crate::monitor::Monitor;

/// Receiving end of a [`ChannelMonitor`] subscription.
///
/// Each subscription sees every event published after it was created.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything already delivered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Broadcasts engine events to any number of subscriptions.
#[derive(Debug, Default)]
pub struct ChannelMonitor {
    subscribers: Mutex<Vec<mpsc::Sender<EngineEvent>>>,
}

impl ChannelMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        Subscription::new(rx)
    }
}

impl Monitor for ChannelMonitor {
    fn on_event(&self, event: &EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Drop subscriptions whose receiver is gone.
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
