use rmb_core::{ConsumerId, CoreError, QueueId};
use thiserror::Error;

use crate::spi::repository::RepositoryError;
use crate::spi::serializer::SerializationError;
use crate::spi::transaction::TransactionError;

/// Errors returned by the broker's public operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue already registered: {0}")]
    DuplicateQueue(QueueId),

    #[error("consumer already registered: {0}")]
    DuplicateConsumer(ConsumerId),

    #[error("unknown queue: {0}")]
    UnknownQueue(QueueId),

    #[error("broker not started")]
    NotStarted,

    #[error("broker stopped")]
    Stopped,

    #[error("queues cannot be registered after the broker started")]
    AlreadyStarted,

    #[error("publishing requires an active transaction")]
    NotInTransaction,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("failed to spawn broker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BrokerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
