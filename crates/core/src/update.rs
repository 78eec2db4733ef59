//! Optimistic status updates.
//!
//! A `MessageProcessingUpdate` pairs the status a writer read (`from`) with
//! the status it wants to store (`to`). A repository must apply it only if
//! the stored version token still equals `from.version_id()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::{ConsumerId, MessageId, QueueId, VersionId};
use crate::status::{MessageProcessingStatus, State};

/// Immutable facts about a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetails {
    queue_id: QueueId,
    message_id: MessageId,
    publication_time: DateTime<Utc>,
}

impl MessageDetails {
    pub fn new(queue_id: QueueId, message_id: MessageId, publication_time: DateTime<Utc>) -> Self {
        Self {
            queue_id,
            message_id,
            publication_time,
        }
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn publication_time(&self) -> DateTime<Utc> {
        self.publication_time
    }
}

/// A status change for one (message, consumer) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProcessingUpdate {
    details: MessageDetails,
    consumer_id: ConsumerId,
    from: MessageProcessingStatus,
    to: MessageProcessingStatus,
}

impl MessageProcessingUpdate {
    /// Combine an already computed status change.
    ///
    /// Fails when `from -> to` is not a legal transition.
    pub fn create(
        details: MessageDetails,
        consumer_id: ConsumerId,
        from: MessageProcessingStatus,
        to: MessageProcessingStatus,
    ) -> CoreResult<Self> {
        if !from.state().can_transition_to(to.state()) {
            return Err(CoreError::InvalidTransition {
                from: from.state(),
                to: to.state(),
            });
        }
        Ok(Self {
            details,
            consumer_id,
            from,
            to,
        })
    }

    /// Claim a pending or timed-out message for processing.
    pub fn take(
        details: MessageDetails,
        consumer_id: ConsumerId,
        current: MessageProcessingStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let to = current.transition(
            State::Processing,
            current.retries(),
            current.error_message().map(str::to_owned),
            now,
        )?;
        Ok(Self {
            details,
            consumer_id,
            from: current,
            to,
        })
    }

    /// Refresh the processing timestamp (keep-alive).
    pub fn processing(&self, now: DateTime<Utc>) -> CoreResult<Self> {
        self.next(State::Processing, self.to.retries(), self.carried_error(), now)
    }

    /// Record a failed attempt that will be retried.
    pub fn retry(&self, error_message: impl Into<String>, now: DateTime<Utc>) -> CoreResult<Self> {
        self.next(
            State::Processing,
            self.to.retries() + 1,
            Some(error_message.into()),
            now,
        )
    }

    pub fn completed(&self, now: DateTime<Utc>) -> CoreResult<Self> {
        self.next(State::Completed, self.to.retries(), None, now)
    }

    /// Record a permanent failure.
    pub fn failed(&self, error_message: impl Into<String>, now: DateTime<Utc>) -> CoreResult<Self> {
        self.next(
            State::Failed,
            self.to.retries(),
            Some(error_message.into()),
            now,
        )
    }

    /// Mark a stalled processing record as reclaimable.
    pub fn timed_out(&self, now: DateTime<Utc>) -> CoreResult<Self> {
        self.next(State::TimedOut, self.to.retries(), self.carried_error(), now)
    }

    fn carried_error(&self) -> Option<String> {
        self.to.error_message().map(str::to_owned)
    }

    fn next(
        &self,
        state: State,
        retries: u32,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let to = self.to.transition(state, retries, error_message, now)?;
        Ok(Self {
            details: self.details.clone(),
            consumer_id: self.consumer_id.clone(),
            from: self.to.clone(),
            to,
        })
    }

    pub fn details(&self) -> &MessageDetails {
        &self.details
    }

    pub fn queue_id(&self) -> &QueueId {
        self.details.queue_id()
    }

    pub fn message_id(&self) -> MessageId {
        self.details.message_id()
    }

    pub fn publication_time(&self) -> DateTime<Utc> {
        self.details.publication_time()
    }

    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    /// The status this update was derived from.
    pub fn from_status(&self) -> &MessageProcessingStatus {
        &self.from
    }

    /// The status this update writes.
    pub fn to_status(&self) -> &MessageProcessingStatus {
        &self.to
    }

    pub fn from_state(&self) -> State {
        self.from.state()
    }

    pub fn to_state(&self) -> State {
        self.to.state()
    }

    pub fn retries(&self) -> u32 {
        self.to.retries()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.to.error_message()
    }

    /// Version token the stored record must still carry for the write to apply.
    pub fn from_version_id(&self) -> VersionId {
        self.from.version_id()
    }

    pub fn version_id(&self) -> VersionId {
        self.to.version_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed() -> MessageProcessingUpdate {
        let now = Utc::now();
        let details = MessageDetails::new(QueueId::new("q").unwrap(), MessageId::new(), now);
        MessageProcessingUpdate::take(
            details,
            ConsumerId::new("c").unwrap(),
            MessageProcessingStatus::pending(now),
            now,
        )
        .unwrap()
    }

    #[test]
    fn take_moves_pending_to_processing() {
        let update = claimed();
        assert_eq!(update.from_state(), State::Pending);
        assert_eq!(update.to_state(), State::Processing);
        assert_eq!(update.retries(), 0);
    }

    #[test]
    fn chained_updates_derive_from_the_previous_write() {
        let update = claimed();
        let retry = update.retry("boom", Utc::now()).unwrap();

        assert_eq!(retry.from_version_id(), update.version_id());
        assert_eq!(retry.retries(), 1);
        assert_eq!(retry.error_message(), Some("boom"));

        let keep_alive = retry.processing(Utc::now()).unwrap();
        assert_eq!(keep_alive.retries(), 1);
        assert_eq!(keep_alive.error_message(), Some("boom"));
        assert_ne!(keep_alive.version_id(), retry.version_id());
    }

    #[test]
    fn completed_clears_the_error_and_keeps_retries() {
        let done = claimed()
            .retry("first", Utc::now())
            .unwrap()
            .retry("second", Utc::now())
            .unwrap()
            .completed(Utc::now())
            .unwrap();

        assert_eq!(done.to_state(), State::Completed);
        assert_eq!(done.retries(), 2);
        assert_eq!(done.error_message(), None);
    }

    #[test]
    fn terminal_updates_cannot_be_extended() {
        let failed = claimed().failed("nope", Utc::now()).unwrap();
        assert!(failed.processing(Utc::now()).is_err());
        assert!(failed.timed_out(Utc::now()).is_err());
    }
}
