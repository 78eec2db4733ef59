//! Core error model.

use thiserror::Error;

use crate::status::State;

/// Result type used by the value-type layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while constructing identifiers or checking transitions.
///
/// These are deterministic and never transient: retrying the same call
/// yields the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was empty or malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status change that the processing state machine does not allow.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
