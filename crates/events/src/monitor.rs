//! Monitor sinks.
//!
//! A monitor is fire-and-forget: it cannot fail and a panic inside one sink
//! is contained, so observers never influence engine state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::event::EngineEvent;

/// Receiver of engine events.
pub trait Monitor: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<T> Monitor for Arc<T>
where
    T: Monitor + ?Sized,
{
    fn on_event(&self, event: &EngineEvent) {
        (**self).on_event(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Fan-out over a fixed set of sinks.
#[derive(Clone, Default)]
pub struct Monitors {
    sinks: Arc<Vec<Arc<dyn Monitor>>>,
}

impl Monitors {
    pub fn new(sinks: Vec<Arc<dyn Monitor>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver `event` to every sink in registration order.
    pub fn emit(&self, event: EngineEvent) {
        for sink in self.sinks.iter() {
            let delivered = catch_unwind(AssertUnwindSafe(|| sink.on_event(&event)));
            if delivered.is_err() {
                tracing::error!(event = ?event.kind(), "monitor panicked while handling event");
            }
        }
    }
}

impl core::fmt::Debug for Monitors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Monitors")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Monitor for Monitors {
    fn on_event(&self, event: &EngineEvent) {
        self.emit(event.clone())
    }
}
