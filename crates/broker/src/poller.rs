//! Message discovery and dispatch.
//!
//! The poller claims messages for every registered consumer, never more
//! than the consumer's free parallel slots, and hands each claim to a
//! [`Worker`] running on the worker pool. A slot is reserved before the
//! repository is asked and released when the worker finishes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rmb_core::{ConsumerId, QueueId};
use rmb_events::EngineEvent;
use tracing::{debug, error, warn};

use crate::consumer::ConsumerDispatch;
use crate::pool::WorkerPool;
use crate::spi::repository::ClaimedMessage;
use crate::worker::{Worker, WorkerContext, WorkerError, WorkerOutcome};

struct ConsumerSlot {
    queue_id: QueueId,
    consumer: Arc<dyn ConsumerDispatch>,
    in_flight: AtomicUsize,
}

impl ConsumerSlot {
    fn id(&self) -> &ConsumerId {
        self.consumer.policy().id()
    }

    /// Reserve every free slot; returns how many were reserved.
    fn reserve(&self) -> usize {
        let max = self.consumer.policy().messages_handled_in_parallel();
        match self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(max))
        {
            Ok(previous) => max - previous,
            Err(_) => 0,
        }
    }

    fn release(&self, count: usize) {
        if count > 0 {
            self.in_flight.fetch_sub(count, Ordering::AcqRel);
        }
    }
}

/// Releases one reserved slot when dropped.
struct SlotGuard(Arc<ConsumerSlot>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release(1);
    }
}

struct PollerInner {
    context: WorkerContext,
    slots: RwLock<Vec<Arc<ConsumerSlot>>>,
    pool: RwLock<Option<Arc<WorkerPool>>>,
}

/// Claims messages and dispatches them to workers.
///
/// Cloning yields another handle to the same poller.
#[derive(Clone)]
pub struct MessagePoller {
    inner: Arc<PollerInner>,
}

impl MessagePoller {
    pub(crate) fn new(context: WorkerContext) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                context,
                slots: RwLock::new(Vec::new()),
                pool: RwLock::new(None),
            }),
        }
    }

    /// Add capacity tracking for the consumers of `queue_id`.
    pub(crate) fn register_consumers(
        &self,
        queue_id: &QueueId,
        consumers: Vec<Arc<dyn ConsumerDispatch>>,
    ) {
        let mut slots = self.inner.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.extend(consumers.into_iter().map(|consumer| {
            Arc::new(ConsumerSlot {
                queue_id: queue_id.clone(),
                consumer,
                in_flight: AtomicUsize::new(0),
            })
        }));
    }

    pub(crate) fn start(&self, pool: WorkerPool) {
        *self.inner.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(pool));
    }

    /// Stop dispatching, interrupt throttled workers and wait for running
    /// workers to return.
    pub(crate) fn stop(&self) {
        let pool = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.context.throttler.interrupt();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }

    fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages of `consumer_id` currently claimed by this poller.
    pub fn in_flight(&self, consumer_id: &ConsumerId) -> usize {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|slot| slot.id() == consumer_id)
            .map_or(0, |slot| slot.in_flight.load(Ordering::Acquire))
    }

    /// Whether `consumer_id` has a free parallel slot.
    pub(crate) fn has_capacity(&self, consumer_id: &ConsumerId) -> bool {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|slot| slot.id() == consumer_id)
            .is_some_and(|slot| {
                slot.in_flight.load(Ordering::Acquire)
                    < slot.consumer.policy().messages_handled_in_parallel()
            })
    }

    /// Claim and dispatch as many messages as the consumers can take.
    ///
    /// Does nothing before the broker starts or after it stops. Repository
    /// failures are reported as events; the next poll starts over.
    pub fn poll(&self) {
        let Some(pool) = self.pool() else {
            return;
        };

        let slots: Vec<Arc<ConsumerSlot>> = self
            .inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let reservations: Vec<(Arc<ConsumerSlot>, usize)> = slots
            .into_iter()
            .filter_map(|slot| {
                let reserved = slot.reserve();
                (reserved > 0).then_some((slot, reserved))
            })
            .collect();
        if reservations.is_empty() {
            return;
        }

        let monitors = &self.inner.context.monitors;
        monitors.emit(EngineEvent::PollingForMessages {
            max_count_by_consumer: reservations
                .iter()
                .map(|(slot, reserved)| (slot.id().clone(), *reserved))
                .collect::<BTreeMap<_, _>>(),
        });

        for (slot, reserved) in reservations {
            let claimed = match self.inner.context.repository.take_for_processing(
                &slot.queue_id,
                slot.id(),
                reserved,
            ) {
                Ok(claimed) => claimed,
                Err(err) => {
                    slot.release(reserved);
                    error!(consumer_id = %slot.id(), error = %err, "polling for messages failed");
                    monitors.emit(EngineEvent::PollingForMessagesFailed {
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let dispatched = claimed.len().min(reserved);
            slot.release(reserved - dispatched);
            for message in claimed.into_iter().take(dispatched) {
                self.dispatch(&pool, &slot, message);
            }
        }
    }

    fn dispatch(&self, pool: &WorkerPool, slot: &Arc<ConsumerSlot>, claimed: ClaimedMessage) {
        let guard = SlotGuard(slot.clone());
        let message_id = claimed.update.message_id();
        let worker = Worker::new(&self.inner.context, slot.consumer.clone(), claimed);
        let poller = self.clone();

        let job = Box::new(move || {
            poller.finish(worker.consume(), &worker);
            drop(guard);
            // Freed a slot: pick up any backlog without waiting for the watcher.
            poller.poll();
        });

        if pool.submit(job).is_err() {
            // Left in PROCESSING; the watcher reclaims it once it times out.
            warn!(
                consumer_id = %slot.id(),
                message_id = %message_id,
                "worker pool closed, message not dispatched"
            );
        }
    }

    fn finish(&self, result: Result<WorkerOutcome, WorkerError>, worker: &Worker) {
        let current = worker.current();
        match result {
            Ok(outcome) => debug!(
                consumer_id = %current.consumer_id(),
                message_id = %current.message_id(),
                outcome = ?outcome,
                "worker finished"
            ),
            Err(WorkerError::UpdateConflict(update)) => {
                self.inner.context.monitors.emit(EngineEvent::MessageUpdateConflict {
                    update: *update,
                    message: worker.message().clone(),
                });
            }
            Err(WorkerError::Interrupted) => debug!(
                consumer_id = %current.consumer_id(),
                message_id = %current.message_id(),
                "worker interrupted"
            ),
            Err(err) => error!(
                consumer_id = %current.consumer_id(),
                message_id = %current.message_id(),
                error = %err,
                "worker failed"
            ),
        }
    }
}

impl core::fmt::Debug for MessagePoller {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let slots = self.inner.slots.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MessagePoller")
            .field("consumers", &slots.len())
            .field("started", &self.pool().is_some())
            .finish()
    }
}
