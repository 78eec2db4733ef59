//! Host transaction integration.

use std::sync::Arc;

/// Work deferred until the enclosing transaction commits.
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait TransactionSynchronizer: Send + Sync {
    /// Whether the calling thread is inside an active transaction.
    fn is_in_transaction(&self) -> bool;

    /// Run `callback` after the calling thread's transaction commits.
    ///
    /// The callback must never run on rollback.
    fn notify_on_commit(&self, callback: CommitCallback) -> Result<(), TransactionError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransactionError {
    #[error("no active transaction on this thread")]
    NotInTransaction,
    #[error("a transaction is already active on this thread")]
    AlreadyActive,
    #[error("transaction state unavailable: {0}")]
    Unavailable(String),
}

impl<T> TransactionSynchronizer for Arc<T>
where
    T: TransactionSynchronizer + ?Sized,
{
    fn is_in_transaction(&self) -> bool {
        (**self).is_in_transaction()
    }

    fn notify_on_commit(&self, callback: CommitCallback) -> Result<(), TransactionError> {
        (**self).notify_on_commit(callback)
    }
}
