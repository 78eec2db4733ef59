//! In-memory collaborators for tests and local development.

pub mod repository;
pub mod transaction;

pub use repository::InMemoryMessageRepository;
pub use transaction::{LocalTransactionSynchronizer, Transaction};
