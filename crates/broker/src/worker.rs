//! Per-message worker.
//!
//! A [`Worker`] owns one claimed (message, consumer) pair for its whole
//! life: it runs the handler, records retries with throttling in between
//! and writes the terminal status. Every status write, including
//! keep-alives sent from handler threads, goes through a single per-worker
//! lock and is derived from the last status this worker stored.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rmb_core::{Clock, CoreError, CoreResult, MessageId, MessageProcessingUpdate, State};
use rmb_events::{EngineEvent, Monitors};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::consumer::{BoundHandler, ConsumerDispatch};
use crate::spi::repository::{ClaimedMessage, MessageRepository, RepositoryError};
use crate::spi::serializer::{MessageSerializer, SerializationError};
use crate::throttle::{ThrottleError, Throttler};

/// Collaborators shared by every worker of a broker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) repository: Arc<dyn MessageRepository>,
    pub(crate) serializer: Arc<dyn MessageSerializer>,
    pub(crate) monitors: Monitors,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) throttler: Throttler,
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The stored status moved on (e.g. reclaimed as timed out); the
    /// rejected update is attached.
    #[error("status update for message {} was rejected by a concurrent write", .0.message_id())]
    UpdateConflict(Box<MessageProcessingUpdate>),
    #[error("worker interrupted by shutdown")]
    Interrupted,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    InvalidState(#[from] CoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum KeepAliveError {
    #[error("processing of the message has already concluded")]
    Concluded,
    #[error("message {0} was updated concurrently")]
    Conflict(MessageId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    InvalidState(#[from] CoreError),
}

pub(crate) trait KeepAliveTarget: Send + Sync {
    fn keep_alive(&self) -> Result<(), KeepAliveError>;
}

/// Refreshes the processing timestamp of the message being handled.
///
/// Cheap to clone and safe to move to another thread. Calls after the
/// worker has finished fail with [`KeepAliveError::Concluded`].
#[derive(Clone)]
pub struct KeepAlive {
    target: Option<Arc<dyn KeepAliveTarget>>,
}

impl KeepAlive {
    pub(crate) fn new(target: Arc<dyn KeepAliveTarget>) -> Self {
        Self {
            target: Some(target),
        }
    }

    /// A keep-alive attached to no message; `send` always succeeds.
    ///
    /// Useful for calling keep-alive handlers directly in tests.
    pub fn detached() -> Self {
        Self { target: None }
    }

    pub fn send(&self) -> Result<(), KeepAliveError> {
        match &self.target {
            Some(target) => target.keep_alive(),
            None => Ok(()),
        }
    }
}

impl core::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("attached", &self.target.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct CellState {
    current: MessageProcessingUpdate,
    concluded: bool,
    conflict: Option<MessageProcessingUpdate>,
}

/// The status a worker last stored, guarded by the per-worker lock.
struct StatusCell {
    state: Mutex<CellState>,
    repository: Arc<dyn MessageRepository>,
    monitors: Monitors,
    clock: Arc<dyn Clock>,
    message: JsonValue,
}

impl StatusCell {
    fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> MessageProcessingUpdate {
        self.lock().current.clone()
    }

    fn conflict(&self) -> Option<MessageProcessingUpdate> {
        self.lock().conflict.clone()
    }

    fn conclude(&self) {
        self.lock().concluded = true;
    }

    /// Derive the next status from the stored one and write it.
    ///
    /// A rejected write is remembered; every later write fails with the
    /// same conflict.
    fn write(
        &self,
        next: impl FnOnce(&MessageProcessingUpdate) -> CoreResult<MessageProcessingUpdate>,
        conclude: bool,
    ) -> Result<MessageProcessingUpdate, WorkerError> {
        let mut state = self.lock();
        if let Some(conflict) = &state.conflict {
            return Err(WorkerError::UpdateConflict(Box::new(conflict.clone())));
        }

        let update = next(&state.current)?;
        if !self.repository.update(&update)? {
            state.conflict = Some(update.clone());
            state.concluded = true;
            return Err(WorkerError::UpdateConflict(Box::new(update)));
        }

        state.current = update.clone();
        state.concluded |= conclude;
        Ok(update)
    }
}

impl KeepAliveTarget for StatusCell {
    fn keep_alive(&self) -> Result<(), KeepAliveError> {
        let mut state = self.lock();
        if let Some(conflict) = &state.conflict {
            return Err(KeepAliveError::Conflict(conflict.message_id()));
        }
        if state.concluded {
            return Err(KeepAliveError::Concluded);
        }

        let update = state.current.processing(self.clock.now())?;
        if !self.repository.update(&update)? {
            let message_id = update.message_id();
            state.conflict = Some(update);
            return Err(KeepAliveError::Conflict(message_id));
        }
        state.current = update.clone();

        // Emitted under the lock so keep-alive events stay ordered with the
        // worker's own writes.
        self.monitors.emit(EngineEvent::MessageKeptAlive {
            update,
            message: self.message.clone(),
        });
        Ok(())
    }
}

/// Drives one claimed message through one consumer.
pub struct Worker {
    consumer: Arc<dyn ConsumerDispatch>,
    monitors: Monitors,
    clock: Arc<dyn Clock>,
    throttler: Throttler,
    decoded: Result<JsonValue, SerializationError>,
    cell: Arc<StatusCell>,
}

impl Worker {
    pub(crate) fn new(
        context: &WorkerContext,
        consumer: Arc<dyn ConsumerDispatch>,
        claimed: ClaimedMessage,
    ) -> Self {
        let decoded = context.serializer.deserialize(&claimed.serialized_message);
        let message = decoded.as_ref().cloned().unwrap_or(JsonValue::Null);
        let cell = Arc::new(StatusCell {
            state: Mutex::new(CellState {
                current: claimed.update,
                concluded: false,
                conflict: None,
            }),
            repository: context.repository.clone(),
            monitors: context.monitors.clone(),
            clock: context.clock.clone(),
            message,
        });

        Self {
            consumer,
            monitors: context.monitors.clone(),
            clock: context.clock.clone(),
            throttler: context.throttler.clone(),
            decoded,
            cell,
        }
    }

    /// The decoded payload (`Null` if it could not be decoded).
    pub fn message(&self) -> &JsonValue {
        &self.cell.message
    }

    /// The last status this worker stored.
    pub fn current(&self) -> MessageProcessingUpdate {
        self.cell.current()
    }

    pub fn keep_alive(&self) -> KeepAlive {
        KeepAlive::new(self.cell.clone())
    }

    /// Process the message to a terminal status.
    ///
    /// Returns `Err` without further writes when a status update is
    /// rejected, when shutdown interrupts a retry wait, or when the
    /// repository fails.
    pub fn consume(&self) -> Result<WorkerOutcome, WorkerError> {
        let result = self.run();
        self.cell.conclude();
        result
    }

    fn run(&self) -> Result<WorkerOutcome, WorkerError> {
        self.notify_start();

        let handler = match self.bind() {
            Ok(handler) => handler,
            Err(err) => return self.reject_undecodable(err),
        };
        let keep_alive = self.keep_alive();
        let policy = self.consumer.policy();

        loop {
            let error = match attempt(&handler, &keep_alive) {
                Ok(()) => return self.complete(),
                Err(error) => error,
            };

            // A keep-alive may have lost a race while the handler ran.
            if let Some(conflict) = self.cell.conflict() {
                return Err(WorkerError::UpdateConflict(Box::new(conflict)));
            }

            if !policy.retries().allows(self.cell.current().retries()) {
                return self.fail(error);
            }

            let retrying = self
                .cell
                .write(|current| current.retry(error.as_str(), self.clock.now()), false)?;
            self.monitors.emit(EngineEvent::ThrottlingMessageRetry {
                update: retrying.clone(),
                message: self.message().clone(),
                error: error.clone(),
                delay: policy.throttling_strategy().delay(retrying.retries()),
            });

            self.throttle(retrying.retries(), &keep_alive)?;

            self.monitors.emit(EngineEvent::RetryingMessageConsumption {
                update: self.cell.current(),
                message: self.message().clone(),
                error,
            });
        }
    }

    fn notify_start(&self) {
        let update = self.cell.current();
        let message = self.message().clone();
        let event = if update.from_state() == State::TimedOut {
            EngineEvent::ConsumingTimedOutMessage { update, message }
        } else {
            EngineEvent::ConsumingNewMessage { update, message }
        };
        self.monitors.emit(event);
    }

    fn bind(&self) -> Result<BoundHandler<'_>, SerializationError> {
        match &self.decoded {
            Ok(message) => self.consumer.bind(message),
            Err(err) => Err(err.clone()),
        }
    }

    fn complete(&self) -> Result<WorkerOutcome, WorkerError> {
        let update = self
            .cell
            .write(|current| current.completed(self.clock.now()), true)?;
        self.monitors.emit(EngineEvent::MessageConsumed {
            update,
            message: self.message().clone(),
        });
        Ok(WorkerOutcome::Completed)
    }

    fn fail(&self, error: String) -> Result<WorkerOutcome, WorkerError> {
        let update = self
            .cell
            .write(|current| current.failed(error.as_str(), self.clock.now()), true)?;
        self.monitors.emit(EngineEvent::MessageConsumptionFailed {
            update,
            message: self.message().clone(),
            error,
        });
        Ok(WorkerOutcome::Failed)
    }

    /// A payload the consumer cannot decode will never succeed; fail it
    /// without spending retries.
    fn reject_undecodable(&self, err: SerializationError) -> Result<WorkerOutcome, WorkerError> {
        debug!(
            consumer_id = %self.consumer.policy().id(),
            message_id = %self.cell.current().message_id(),
            error = %err,
            "rejecting undecodable message"
        );
        self.fail(err.to_string())
    }

    fn throttle(&self, retry_count: u32, keep_alive: &KeepAlive) -> Result<(), WorkerError> {
        match self
            .throttler
            .throttle(retry_count, self.consumer.policy(), keep_alive)
        {
            Ok(()) => Ok(()),
            Err(ThrottleError::Interrupted) => Err(WorkerError::Interrupted),
            Err(ThrottleError::KeepAlive(err)) => Err(match self.cell.conflict() {
                Some(conflict) => WorkerError::UpdateConflict(Box::new(conflict)),
                None => match err {
                    KeepAliveError::Repository(e) => WorkerError::Repository(e),
                    KeepAliveError::InvalidState(e) => WorkerError::InvalidState(e),
                    KeepAliveError::Concluded | KeepAliveError::Conflict(_) => {
                        WorkerError::Interrupted
                    }
                },
            }),
        }
    }
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("consumer_id", self.consumer.policy().id())
            .field("current", &self.cell.current())
            .finish_non_exhaustive()
    }
}

/// Run the handler once; errors and panics become the failure message.
fn attempt(handler: &BoundHandler<'_>, keep_alive: &KeepAlive) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| handler(keep_alive))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerConfig, MessageConsumer, Retries};
    use crate::in_memory::InMemoryMessageRepository;
    use crate::shutdown::ShutdownSignal;
    use crate::spi::serializer::JsonMessageSerializer;
    use crate::throttle::{FixedDelay, NoThrottling};
    use rmb_core::{ConsumerId, ManualClock, QueueId, SystemClock};
    use rmb_events::{ChannelMonitor, EventKind, Monitor};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        repository: Arc<InMemoryMessageRepository>,
        monitor: Arc<ChannelMonitor>,
        context: WorkerContext,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_clock(Arc::new(SystemClock))
        }

        fn with_clock(clock: Arc<dyn Clock>) -> Self {
            let repository = Arc::new(InMemoryMessageRepository::with_clock(clock.clone()));
            let monitor = Arc::new(ChannelMonitor::new());
            let sink: Arc<dyn Monitor> = monitor.clone();
            let context = WorkerContext {
                repository: repository.clone(),
                serializer: Arc::new(JsonMessageSerializer),
                monitors: Monitors::new(vec![sink]),
                clock,
                throttler: Throttler::new(ShutdownSignal::new()),
            };
            Self {
                repository,
                monitor,
                context,
            }
        }

        fn worker(&self, consumer: MessageConsumer<u32>, payload: &[u8]) -> Worker {
            let queue = QueueId::new("orders").unwrap();
            let consumer_id = consumer.id().clone();
            self.repository
                .add(&queue, &[consumer_id.clone()], payload.to_vec())
                .unwrap();
            let claimed = self
                .repository
                .take_for_processing(&queue, &consumer_id, 1)
                .unwrap()
                .remove(0);
            Worker::new(&self.context, Arc::new(consumer.register().unwrap()), claimed)
        }

        fn stored_state(&self, worker: &Worker) -> (State, u32) {
            let current = worker.current();
            let status = self
                .repository
                .status(current.message_id(), current.consumer_id())
                .unwrap()
                .unwrap();
            (status.state(), status.retries())
        }
    }

    fn config(retries: Retries) -> ConsumerConfig {
        ConsumerConfig::new(ConsumerId::new("billing").unwrap())
            .with_retries(retries)
            .with_throttling_strategy(NoThrottling)
    }

    #[test]
    fn success_completes_the_message() {
        let fixture = Fixture::new();
        let worker = fixture.worker(MessageConsumer::new(config(Retries::Limited(3)), |_: &u32| Ok(())), b"1");
        let events = fixture.monitor.subscribe();

        assert_eq!(worker.consume().unwrap(), WorkerOutcome::Completed);
        assert_eq!(fixture.stored_state(&worker), (State::Completed, 0));

        let kinds: Vec<EventKind> = events.drain().iter().map(EngineEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::ConsumingNewMessage, EventKind::MessageConsumed]);
    }

    #[test]
    fn always_failing_handler_fails_after_max_retries() {
        let fixture = Fixture::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let consumer = MessageConsumer::new(config(Retries::Limited(3)), move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always broken")
        });
        let worker = fixture.worker(consumer, b"1");

        assert_eq!(worker.consume().unwrap(), WorkerOutcome::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(fixture.stored_state(&worker), (State::Failed, 3));
        assert_eq!(worker.current().error_message(), Some("always broken"));
    }

    #[test]
    fn handler_recovering_before_the_budget_completes_with_its_retry_count() {
        let fixture = Fixture::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let consumer = MessageConsumer::new(config(Retries::Limited(5)), move |_: &u32| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("not yet");
            }
            Ok(())
        });
        let worker = fixture.worker(consumer, b"1");
        let events = fixture.monitor.subscribe();

        assert_eq!(worker.consume().unwrap(), WorkerOutcome::Completed);
        assert_eq!(fixture.stored_state(&worker), (State::Completed, 2));

        let kinds: Vec<EventKind> = events.drain().iter().map(EngineEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ConsumingNewMessage,
                EventKind::ThrottlingMessageRetry,
                EventKind::RetryingMessageConsumption,
                EventKind::ThrottlingMessageRetry,
                EventKind::RetryingMessageConsumption,
                EventKind::MessageConsumed,
            ]
        );
    }

    #[test]
    fn panics_are_treated_as_failures() {
        let fixture = Fixture::new();
        let consumer = MessageConsumer::new(config(Retries::Limited(0)), |_: &u32| -> anyhow::Result<()> {
            panic!("kaboom")
        });
        let worker = fixture.worker(consumer, b"1");

        assert_eq!(worker.consume().unwrap(), WorkerOutcome::Failed);
        assert_eq!(worker.current().error_message(), Some("handler panicked: kaboom"));
    }

    #[test]
    fn undecodable_payload_fails_without_retries() {
        let fixture = Fixture::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let consumer = MessageConsumer::new(config(Retries::UntilSuccess), move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let worker = fixture.worker(consumer, br#""not a number""#);

        assert_eq!(worker.consume().unwrap(), WorkerOutcome::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.stored_state(&worker), (State::Failed, 0));
    }

    #[test]
    fn keep_alive_refreshes_the_stored_status() {
        let clock = Arc::new(ManualClock::default());
        let fixture = Fixture::with_clock(clock.clone());
        let tick = clock.clone();
        let consumer = MessageConsumer::with_keep_alive(config(Retries::Limited(0)), move |_: &u32, keep_alive: &KeepAlive| {
            tick.advance(Duration::from_secs(5));
            keep_alive.send()?;
            Ok(())
        });
        let worker = fixture.worker(consumer, b"1");
        let claimed_at = worker.current().to_status().last_updated();
        let events = fixture.monitor.subscribe();

        assert_eq!(worker.consume().unwrap(), WorkerOutcome::Completed);

        let kept_alive = events
            .drain()
            .into_iter()
            .find(|e| e.kind() == EventKind::MessageKeptAlive)
            .unwrap();
        let update = kept_alive.update().unwrap();
        assert_eq!(update.to_state(), State::Processing);
        assert!(update.to_status().last_updated() > claimed_at);
        assert_eq!(fixture.stored_state(&worker), (State::Completed, 0));
    }

    #[test]
    fn keep_alive_after_completion_is_rejected() {
        let fixture = Fixture::new();
        let worker = fixture.worker(MessageConsumer::new(config(Retries::Limited(0)), |_: &u32| Ok(())), b"1");
        let keep_alive = worker.keep_alive();

        worker.consume().unwrap();

        assert!(matches!(keep_alive.send(), Err(KeepAliveError::Concluded)));
    }

    #[test]
    fn concurrent_reclaim_surfaces_as_a_conflict() {
        let clock = Arc::new(ManualClock::default());
        let fixture = Fixture::with_clock(clock.clone());
        let repository = fixture.repository.clone();
        let tick = clock.clone();
        let consumer = MessageConsumer::new(config(Retries::Limited(0)), move |_: &u32| {
            // The watcher reclaims the message while the handler is running.
            tick.advance(Duration::from_secs(120));
            let consumer_id = ConsumerId::new("billing").unwrap();
            repository.reclaim_timed_out(&consumer_id, Duration::from_secs(60))?;
            Ok(())
        });
        let worker = fixture.worker(consumer, b"1");

        let err = worker.consume().unwrap_err();

        let WorkerError::UpdateConflict(rejected) = err else {
            panic!("expected a conflict, got {err:?}");
        };
        assert_eq!(rejected.to_state(), State::Completed);
        assert_eq!(fixture.stored_state(&worker).0, State::TimedOut);
    }

    #[test]
    fn keep_alive_from_another_thread_serializes_with_retries() {
        let fixture = Fixture::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let config = config(Retries::Limited(2)).with_throttling_strategy(FixedDelay(Duration::from_millis(5)));
        let consumer = MessageConsumer::with_keep_alive(config, move |_: &u32, keep_alive: &KeepAlive| {
            let pinger = keep_alive.clone();
            let pings = thread::spawn(move || {
                for _ in 0..20 {
                    let _ = pinger.send();
                }
            });
            pings.join().ok();
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("flaky");
            }
            Ok(())
        });
        let worker = fixture.worker(consumer, b"1");
        let events = fixture.monitor.subscribe();

        assert_eq!(worker.consume().unwrap(), WorkerOutcome::Completed);
        assert_eq!(fixture.stored_state(&worker), (State::Completed, 2));

        // Every write was derived from the one before it.
        let updates: Vec<MessageProcessingUpdate> = events
            .drain()
            .iter()
            .filter(|e| {
                matches!(
                    e.kind(),
                    EventKind::MessageKeptAlive | EventKind::ThrottlingMessageRetry | EventKind::MessageConsumed
                )
            })
            .filter_map(|e| e.update().cloned())
            .collect();
        for pair in updates.windows(2) {
            assert_eq!(pair[1].from_version_id(), pair[0].version_id());
        }
    }

    #[test]
    fn shutdown_interrupts_a_retry_wait() {
        let fixture = Fixture::new();
        let config = config(Retries::UntilSuccess).with_throttling_strategy(FixedDelay(Duration::from_secs(30)));
        let consumer = MessageConsumer::new(config, |_: &u32| anyhow::bail!("down"));
        let worker = fixture.worker(consumer, b"1");
        let throttler = fixture.context.throttler.clone();

        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            throttler.interrupt();
        });

        assert!(matches!(worker.consume(), Err(WorkerError::Interrupted)));
        interrupter.join().unwrap();
        assert_eq!(fixture.stored_state(&worker), (State::Processing, 1));
    }
}
