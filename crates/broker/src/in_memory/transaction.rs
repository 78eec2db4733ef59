//! Thread-local style transactions for tests/dev.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::spi::transaction::{CommitCallback, TransactionError, TransactionSynchronizer};

/// Tracks one open transaction per thread.
///
/// Commit callbacks registered inside a transaction run on the committing
/// thread after [`Transaction::commit`]; a rolled back (or dropped)
/// transaction discards them.
#[derive(Default)]
pub struct LocalTransactionSynchronizer {
    active: Mutex<HashMap<ThreadId, Vec<CommitCallback>>>,
}

impl LocalTransactionSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<CommitCallback>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a transaction on the calling thread.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction, TransactionError> {
        let thread_id = thread::current().id();
        let mut active = self.lock();
        if active.contains_key(&thread_id) {
            return Err(TransactionError::AlreadyActive);
        }
        active.insert(thread_id, Vec::new());
        Ok(Transaction {
            synchronizer: Arc::clone(self),
            thread_id,
            finished: false,
            _thread_bound: PhantomData,
        })
    }

    /// Run `f` in a transaction, committing on `Ok` and rolling back on `Err`.
    pub fn in_transaction<T, E>(self: &Arc<Self>, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<TransactionError>,
    {
        let transaction = self.begin()?;
        match f() {
            Ok(value) => {
                transaction.commit();
                Ok(value)
            }
            Err(err) => {
                transaction.rollback();
                Err(err)
            }
        }
    }

    fn finish(&self, thread_id: ThreadId) -> Vec<CommitCallback> {
        self.lock().remove(&thread_id).unwrap_or_default()
    }
}

impl core::fmt::Debug for LocalTransactionSynchronizer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalTransactionSynchronizer")
            .field("active", &self.lock().len())
            .finish()
    }
}

impl TransactionSynchronizer for LocalTransactionSynchronizer {
    fn is_in_transaction(&self) -> bool {
        self.lock().contains_key(&thread::current().id())
    }

    fn notify_on_commit(&self, callback: CommitCallback) -> Result<(), TransactionError> {
        let mut active = self.lock();
        let callbacks = active
            .get_mut(&thread::current().id())
            .ok_or(TransactionError::NotInTransaction)?;
        callbacks.push(callback);
        Ok(())
    }
}

/// An open transaction. Dropping it without committing rolls it back.
#[must_use = "a transaction rolls back when dropped"]
pub struct Transaction {
    synchronizer: Arc<LocalTransactionSynchronizer>,
    thread_id: ThreadId,
    finished: bool,
    // Tied to the thread that opened it.
    _thread_bound: PhantomData<*const ()>,
}

impl Transaction {
    /// Commit and run every registered callback, in registration order.
    pub fn commit(mut self) {
        self.finished = true;
        let callbacks = self.synchronizer.finish(self.thread_id);
        debug!(callbacks = callbacks.len(), "transaction committed");
        for callback in callbacks {
            callback();
        }
    }

    pub fn rollback(mut self) {
        self.finished = true;
        let discarded = self.synchronizer.finish(self.thread_id);
        debug!(callbacks = discarded.len(), "transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.synchronizer.finish(self.thread_id);
        }
    }
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("thread_id", &self.thread_id)
            .field("finished", &self.finished)
            .finish()
    }
}
