//! `rmb-core`: value types shared by every part of the message broker.
//!
//! This crate contains no threads and no IO: identifiers, the processing
//! state machine of a (message, consumer) pair and the optimistic update
//! records handed to a repository.

pub mod clock;
pub mod error;
pub mod id;
pub mod status;
pub mod update;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{ConsumerId, MessageId, QueueId, VersionId};
pub use status::{MessageProcessingStatus, State};
pub use update::{MessageDetails, MessageProcessingUpdate};
