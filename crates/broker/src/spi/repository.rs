//! Message repository contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmb_core::{ConsumerId, CoreError, MessageId, MessageProcessingUpdate, QueueId};

/// A message claimed for one consumer, together with its stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedMessage {
    pub update: MessageProcessingUpdate,
    pub serialized_message: Vec<u8>,
}

/// Durable storage of messages and their per-consumer processing status.
///
/// Implementations must make `take_for_processing` an atomic claim and
/// `update` a compare-and-swap on the stored version token.
pub trait MessageRepository: Send + Sync {
    /// Store a new message with a `PENDING` status for every consumer.
    fn add(
        &self,
        queue_id: &QueueId,
        consumer_ids: &[ConsumerId],
        serialized_message: Vec<u8>,
    ) -> Result<MessageId, RepositoryError>;

    /// Claim up to `max_count` pending or timed-out messages, oldest first,
    /// moving each to `PROCESSING`.
    fn take_for_processing(
        &self,
        queue_id: &QueueId,
        consumer_id: &ConsumerId,
        max_count: usize,
    ) -> Result<Vec<ClaimedMessage>, RepositoryError>;

    /// Apply `update` only if the stored version still equals
    /// `update.from_version_id()`.
    ///
    /// Returns `false` on a version conflict, leaving the record untouched.
    fn update(&self, update: &MessageProcessingUpdate) -> Result<bool, RepositoryError>;

    /// Move every record of `consumer_id` that has been `PROCESSING` for
    /// longer than `timeout` to `TIMED_OUT`.
    fn reclaim_timed_out(
        &self,
        consumer_id: &ConsumerId,
        timeout: Duration,
    ) -> Result<Vec<MessageProcessingUpdate>, RepositoryError>;

    /// Number of claimable messages per consumer.
    fn queue_sizes(
        &self,
        consumer_ids: &[ConsumerId],
    ) -> Result<HashMap<ConsumerId, usize>, RepositoryError>;
}

/// Repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("message not found: {0}")]
    NotFound(MessageId),
    #[error("no processing status for consumer {consumer_id} on message {message_id}")]
    UnknownConsumer {
        message_id: MessageId,
        consumer_id: ConsumerId,
    },
    #[error(transparent)]
    InvalidUpdate(#[from] CoreError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

impl<R> MessageRepository for Arc<R>
where
    R: MessageRepository + ?Sized,
{
    fn add(
        &self,
        queue_id: &QueueId,
        consumer_ids: &[ConsumerId],
        serialized_message: Vec<u8>,
    ) -> Result<MessageId, RepositoryError> {
        (**self).add(queue_id, consumer_ids, serialized_message)
    }

    fn take_for_processing(
        &self,
        queue_id: &QueueId,
        consumer_id: &ConsumerId,
        max_count: usize,
    ) -> Result<Vec<ClaimedMessage>, RepositoryError> {
        (**self).take_for_processing(queue_id, consumer_id, max_count)
    }

    fn update(&self, update: &MessageProcessingUpdate) -> Result<bool, RepositoryError> {
        (**self).update(update)
    }

    fn reclaim_timed_out(
        &self,
        consumer_id: &ConsumerId,
        timeout: Duration,
    ) -> Result<Vec<MessageProcessingUpdate>, RepositoryError> {
        (**self).reclaim_timed_out(consumer_id, timeout)
    }

    fn queue_sizes(
        &self,
        consumer_ids: &[ConsumerId],
    ) -> Result<HashMap<ConsumerId, usize>, RepositoryError> {
        (**self).queue_sizes(consumer_ids)
    }
}
