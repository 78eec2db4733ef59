//! `rmb-broker`: a durable, at-least-once message broker over a pluggable
//! message repository.
//!
//! Producers publish inside a host transaction; after commit a poller claims
//! messages for every consumer of the queue and runs one [`worker::Worker`]
//! per claimed message on a bounded thread pool. Workers retry failed
//! handlers with throttling, accept keep-alives from long-running handlers
//! and write every status change with an optimistic version check.

pub mod config;
pub mod consumer;
pub mod error;
pub mod in_memory;
pub mod manager;
pub mod poller;
mod pool;
mod shutdown;
pub mod spi;
pub mod throttle;
pub mod watcher;
pub mod worker;

pub use config::BrokerConfig;
pub use consumer::{ConsumerConfig, ConsumerPolicy, MessageConsumer, Retries};
pub use error::BrokerError;
pub use in_memory::{InMemoryMessageRepository, LocalTransactionSynchronizer, Transaction};
pub use manager::{MessageQueue, MessageQueueManager, MessageQueueManagerBuilder};
pub use poller::MessagePoller;
pub use spi::{
    ClaimedMessage, CommitCallback, JsonMessageSerializer, MessageRepository, MessageSerializer,
    RepositoryError, SerializationError, TransactionError, TransactionSynchronizer,
};
pub use throttle::{
    ExponentialBackoff, FixedDelay, NoThrottling, ThrottleError, Throttler, ThrottlingStrategy,
};
pub use watcher::MessageRepositoryWatcher;
pub use worker::{KeepAlive, KeepAliveError, Worker, WorkerError, WorkerOutcome};
