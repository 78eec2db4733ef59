use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use tracing::{debug, error};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads fed by a channel.
pub(crate) struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` threads named `{name}-worker-{n}`.
    pub(crate) fn spawn(name: &str, size: usize) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pool = Self {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(Vec::with_capacity(size)),
        };

        for n in 0..size.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-worker-{n}"))
                .spawn(move || worker_loop(receiver));
            match spawned {
                Ok(handle) => pool
                    .threads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(err);
                }
            }
        }

        debug!(name, size, "worker pool started");
        Ok(pool)
    }

    /// Queue a job; hands it back if the pool is shut down.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Stop accepting jobs, let queued and running jobs finish, and join
    /// every thread.
    pub(crate) fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in threads {
            // A job that stops the broker cannot join its own thread.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field(
                "threads",
                &self.threads.lock().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .finish()
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("worker pool job panicked");
                }
            }
            // Sender dropped: the pool is shutting down.
            Err(_) => break,
        }
    }
}
