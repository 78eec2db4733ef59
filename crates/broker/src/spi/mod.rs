//! Contracts for the collaborators the engine runs on top of.
//!
//! Storage, payload encoding and host transactions are supplied by the
//! embedding application; `crate::in_memory` has implementations for tests
//! and local development.

pub mod repository;
pub mod serializer;
pub mod transaction;

pub use repository::{ClaimedMessage, MessageRepository, RepositoryError};
pub use serializer::{JsonMessageSerializer, MessageSerializer, SerializationError};
pub use transaction::{CommitCallback, TransactionError, TransactionSynchronizer};
