//! `rmb-events`: engine notifications and the sinks that receive them.

pub mod channel;
pub mod event;
pub mod monitor;

pub use channel::{ChannelMonitor, Subscription};
pub use event::{EngineEvent, EventKind};
pub use monitor::{Monitor, Monitors, NoopMonitor};
