//! Processing status of a message for one consumer.
//!
//! ```text
//! PENDING ──> PROCESSING ──> COMPLETED
//!                 │  ^  └──> FAILED
//!                 v  │
//!              TIMED_OUT
//! ```
//!
//! `PROCESSING -> PROCESSING` is also legal: keep-alives and retries refresh
//! the record without leaving the state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::VersionId;

/// State of a (message, consumer) pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Published, waiting to be claimed
    Pending,
    /// Claimed by a worker
    Processing,
    /// Stalled in processing and reclaimed; claimable again
    TimedOut,
    /// Consumed successfully
    Completed,
    /// Retry budget exhausted
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }

    /// Whether a poller may claim a message in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, State::Pending | State::TimedOut)
    }

    pub fn can_transition_to(&self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (TimedOut, Processing)
                | (Processing, Processing)
                | (Processing, TimedOut)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::Processing => "PROCESSING",
            State::TimedOut => "TIMED_OUT",
            State::Completed => "COMPLETED",
            State::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a processing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProcessingStatus {
    state: State,
    retries: u32,
    error_message: Option<String>,
    last_updated: DateTime<Utc>,
    version_id: VersionId,
}

impl MessageProcessingStatus {
    pub fn new(
        state: State,
        retries: u32,
        error_message: Option<String>,
        last_updated: DateTime<Utc>,
        version_id: VersionId,
    ) -> Self {
        Self {
            state,
            retries,
            error_message,
            last_updated,
            version_id,
        }
    }

    /// Status of a freshly published message.
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self::new(State::Pending, 0, None, now, VersionId::random())
    }

    /// Derive the next status, with a fresh version token.
    ///
    /// Fails if the state machine does not allow the move.
    pub fn transition(
        &self,
        state: State,
        retries: u32,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if !self.state.can_transition_to(state) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: state,
            });
        }
        Ok(Self::new(
            state,
            retries,
            error_message,
            now,
            VersionId::random(),
        ))
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn version_id(&self) -> VersionId {
        self.version_id
    }

    /// Whether this record has been processing for longer than `timeout`.
    pub fn is_timed_out(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        if self.state != State::Processing {
            return false;
        }
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - self.last_updated > timeout,
            Err(_) => false,
        }
    }
}
