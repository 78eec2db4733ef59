//! Periodic repository checks.
//!
//! Two schedules run next to the commit-triggered polls:
//! - queue-size changes, which catch messages published elsewhere
//! - timed-out reclaims, which return stalled messages to the claimable pool
//!
//! A failing cycle is reported and the schedule keeps going.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock, mpsc};
use std::thread;
use std::time::Duration;

use rmb_core::ConsumerId;
use rmb_events::{EngineEvent, Monitors};
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::consumer::ConsumerPolicy;
use crate::error::BrokerError;
use crate::poller::MessagePoller;
use crate::spi::repository::{MessageRepository, RepositoryError};

/// Handle to stop and join one schedule thread.
#[derive(Debug)]
struct ScheduleHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ScheduleHandle {
    /// Request shutdown and wait for the in-flight cycle to finish.
    fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[derive(Debug, Clone)]
struct WatchedConsumer {
    id: ConsumerId,
    timeout: Duration,
}

struct WatcherInner {
    repository: Arc<dyn MessageRepository>,
    poller: MessagePoller,
    monitors: Monitors,
    consumers: RwLock<Vec<WatchedConsumer>>,
    last_sizes: Mutex<HashMap<ConsumerId, usize>>,
}

impl WatcherInner {
    fn consumers(&self) -> Vec<WatchedConsumer> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn queue_size_cycle(&self) -> Result<bool, RepositoryError> {
        let ids: Vec<ConsumerId> = self.consumers().into_iter().map(|c| c.id).collect();
        if ids.is_empty() {
            return Ok(false);
        }
        let sizes = self.repository.queue_sizes(&ids)?;

        let changed = {
            let mut last = self.last_sizes.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = sizes
                .iter()
                .any(|(id, size)| last.get(id).copied().unwrap_or(0) != *size);
            *last = sizes.clone();
            changed
        };
        let waiting = sizes
            .iter()
            .any(|(id, size)| *size > 0 && self.poller.has_capacity(id));

        if changed || waiting {
            debug!(changed, waiting, "queue sizes require a poll");
            self.poller.poll();
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns the number of reclaimed messages, and the first error if
    /// any consumer could not be checked.
    fn timed_out_cycle(&self) -> (usize, Option<RepositoryError>) {
        let mut reclaimed = 0;
        let mut failure = None;
        for consumer in self.consumers() {
            match self.repository.reclaim_timed_out(&consumer.id, consumer.timeout) {
                Ok(updates) => {
                    for update in &updates {
                        info!(
                            consumer_id = %update.consumer_id(),
                            message_id = %update.message_id(),
                            retries = update.retries(),
                            "reclaimed timed-out message"
                        );
                    }
                    reclaimed += updates.len();
                }
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if reclaimed > 0 {
            self.poller.poll();
        }
        (reclaimed, failure)
    }

    fn poll_for_queue_size_changes(&self) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.queue_size_cycle())) {
            Ok(Ok(polled)) => polled,
            Ok(Err(err)) => {
                self.monitors
                    .emit(EngineEvent::PollingForMessageQueueSizeChangesFailed {
                        error: err.to_string(),
                    });
                false
            }
            Err(_) => {
                self.monitors
                    .emit(EngineEvent::PollingForMessageQueueSizeChangesFailed {
                        error: "queue size check panicked".to_string(),
                    });
                false
            }
        }
    }

    fn poll_for_timed_out_messages(&self) -> usize {
        match catch_unwind(AssertUnwindSafe(|| self.timed_out_cycle())) {
            Ok((reclaimed, None)) => reclaimed,
            Ok((reclaimed, Some(err))) => {
                self.monitors.emit(EngineEvent::PollingForTimedOutMessagesFailed {
                    error: err.to_string(),
                });
                reclaimed
            }
            Err(_) => {
                self.monitors.emit(EngineEvent::PollingForTimedOutMessagesFailed {
                    error: "timed-out message check panicked".to_string(),
                });
                0
            }
        }
    }
}

/// Background scheduler for queue-size and timed-out checks.
pub struct MessageRepositoryWatcher {
    inner: Arc<WatcherInner>,
    schedules: Mutex<Vec<ScheduleHandle>>,
}

impl MessageRepositoryWatcher {
    pub(crate) fn new(
        repository: Arc<dyn MessageRepository>,
        poller: MessagePoller,
        monitors: Monitors,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                repository,
                poller,
                monitors,
                consumers: RwLock::new(Vec::new()),
                last_sizes: Mutex::new(HashMap::new()),
            }),
            schedules: Mutex::new(Vec::new()),
        }
    }

    /// Watch the consumers of a newly registered queue.
    pub(crate) fn include_queue(&self, consumers: &[ConsumerPolicy]) {
        let mut watched = self
            .inner
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        watched.extend(consumers.iter().map(|policy| WatchedConsumer {
            id: policy.id().clone(),
            timeout: policy.timeout(),
        }));
    }

    /// Run one queue-size check now. Returns `true` if it triggered a poll.
    ///
    /// Failures are reported as events, never returned.
    pub fn poll_for_queue_size_changes(&self) -> bool {
        self.inner.poll_for_queue_size_changes()
    }

    /// Run one timed-out reclaim now. Returns the number of reclaimed
    /// messages.
    ///
    /// Failures are reported as events, never returned.
    pub fn poll_for_timed_out_messages(&self) -> usize {
        self.inner.poll_for_timed_out_messages()
    }

    pub(crate) fn start(&self, config: &BrokerConfig) -> Result<(), BrokerError> {
        let sizes = {
            let inner = self.inner.clone();
            spawn_schedule(
                format!("{}-watch-sizes", config.name),
                config.queue_size_poll_interval,
                move || {
                    inner.poll_for_queue_size_changes();
                },
            )?
        };
        let timed_out = {
            let inner = self.inner.clone();
            spawn_schedule(
                format!("{}-watch-timeouts", config.name),
                config.timed_out_poll_interval,
                move || {
                    inner.poll_for_timed_out_messages();
                },
            )
        };
        let timed_out = match timed_out {
            Ok(handle) => handle,
            Err(err) => {
                sizes.shutdown();
                return Err(err);
            }
        };

        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([sizes, timed_out]);
        Ok(())
    }

    /// Cancel both schedules and wait for running cycles to finish.
    pub(crate) fn stop(&self) {
        let schedules: Vec<ScheduleHandle> = self
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for schedule in schedules {
            schedule.shutdown();
        }
    }
}

impl core::fmt::Debug for MessageRepositoryWatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageRepositoryWatcher")
            .field("consumers", &self.inner.consumers().len())
            .field(
                "running",
                &!self
                    .schedules
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_empty(),
            )
            .finish()
    }
}

fn spawn_schedule(
    name: String,
    interval: Duration,
    mut cycle: impl FnMut() + Send + 'static,
) -> Result<ScheduleHandle, BrokerError> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let thread_name = name.clone();
    let join = thread::Builder::new().name(thread_name).spawn(move || {
        debug!(schedule = %name, "watcher schedule started");
        loop {
            match shutdown_rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => cycle(),
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(schedule = %name, "watcher schedule stopped");
    })?;

    Ok(ScheduleHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerConfig, ConsumerDispatch, MessageConsumer};
    use crate::in_memory::InMemoryMessageRepository;
    use crate::shutdown::ShutdownSignal;
    use crate::spi::serializer::JsonMessageSerializer;
    use crate::throttle::Throttler;
    use crate::worker::WorkerContext;
    use rmb_core::{Clock, ManualClock, MessageId, MessageProcessingUpdate, QueueId, State};
    use crate::spi::repository::ClaimedMessage;
    use rmb_events::{ChannelMonitor, EventKind, Monitor};

    struct Fixture {
        repository: Arc<InMemoryMessageRepository>,
        clock: Arc<ManualClock>,
        monitor: Arc<ChannelMonitor>,
        watcher: MessageRepositoryWatcher,
    }

    fn queue() -> QueueId {
        QueueId::new("orders").unwrap()
    }

    fn billing() -> ConsumerId {
        ConsumerId::new("billing").unwrap()
    }

    fn fixture_with(
        repository: Arc<dyn MessageRepository>,
        memory: Arc<InMemoryMessageRepository>,
        clock: Arc<ManualClock>,
    ) -> Fixture {
        let monitor = Arc::new(ChannelMonitor::new());
        let sink: Arc<dyn Monitor> = monitor.clone();
        let monitors = Monitors::new(vec![sink]);
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let poller = MessagePoller::new(WorkerContext {
            repository: repository.clone(),
            serializer: Arc::new(JsonMessageSerializer),
            monitors: monitors.clone(),
            clock: clock_dyn,
            throttler: Throttler::new(ShutdownSignal::new()),
        });
        let consumer = MessageConsumer::new(
            ConsumerConfig::new(billing()).with_timeout(Duration::from_secs(60)),
            |_: &u32| Ok(()),
        )
        .register()
        .unwrap();
        let policy = consumer.policy().clone();
        let dispatch: Arc<dyn ConsumerDispatch> = Arc::new(consumer);
        poller.register_consumers(&queue(), vec![dispatch]);

        let watcher = MessageRepositoryWatcher::new(repository, poller, monitors);
        watcher.include_queue(&[policy]);
        Fixture {
            repository: memory,
            clock,
            monitor,
            watcher,
        }
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let memory = Arc::new(InMemoryMessageRepository::with_clock(clock.clone()));
        fixture_with(memory.clone(), memory, clock)
    }

    #[test]
    fn stalled_messages_are_reclaimed_after_their_timeout() {
        let f = fixture();
        let id = f.repository.add(&queue(), &[billing()], b"1".to_vec()).unwrap();
        f.repository.take_for_processing(&queue(), &billing(), 1).unwrap();

        f.clock.advance(Duration::from_secs(59));
        assert_eq!(f.watcher.poll_for_timed_out_messages(), 0);

        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.watcher.poll_for_timed_out_messages(), 1);
        assert_eq!(
            f.repository.status(id, &billing()).unwrap().unwrap().state(),
            State::TimedOut
        );
    }

    #[test]
    fn queue_size_changes_trigger_a_poll_once() {
        let f = fixture();
        assert!(!f.watcher.poll_for_queue_size_changes());

        f.repository.add(&queue(), &[billing()], b"1".to_vec()).unwrap();
        assert!(f.watcher.poll_for_queue_size_changes());

        // Nothing claimable changed and the poller is not started, but the
        // backlog is still waiting on a free consumer.
        assert!(f.watcher.poll_for_queue_size_changes());

        f.repository.take_for_processing(&queue(), &billing(), 1).unwrap();
        assert!(f.watcher.poll_for_queue_size_changes());
        assert!(!f.watcher.poll_for_queue_size_changes());
    }

    struct BrokenRepository;

    impl MessageRepository for BrokenRepository {
        fn add(&self, _: &QueueId, _: &[ConsumerId], _: Vec<u8>) -> Result<MessageId, RepositoryError> {
            Err(RepositoryError::storage("down"))
        }

        fn take_for_processing(&self, _: &QueueId, _: &ConsumerId, _: usize) -> Result<Vec<ClaimedMessage>, RepositoryError> {
            Err(RepositoryError::storage("down"))
        }

        fn update(&self, _: &MessageProcessingUpdate) -> Result<bool, RepositoryError> {
            Err(RepositoryError::storage("down"))
        }

        fn reclaim_timed_out(&self, _: &ConsumerId, _: Duration) -> Result<Vec<MessageProcessingUpdate>, RepositoryError> {
            Err(RepositoryError::storage("down"))
        }

        fn queue_sizes(&self, _: &[ConsumerId]) -> Result<HashMap<ConsumerId, usize>, RepositoryError> {
            panic!("driver bug")
        }
    }

    #[test]
    fn failed_cycles_are_reported_and_the_schedule_survives() {
        let clock = Arc::new(ManualClock::default());
        let memory = Arc::new(InMemoryMessageRepository::with_clock(clock.clone()));
        let f = fixture_with(Arc::new(BrokenRepository), memory, clock);
        let events = f.monitor.subscribe();
        let config = BrokerConfig::default()
            .with_queue_size_poll_interval(Duration::from_millis(10))
            .with_timed_out_poll_interval(Duration::from_millis(10));

        f.watcher.start(&config).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        f.watcher.stop();

        let kinds: Vec<EventKind> = events.drain().iter().map(EngineEvent::kind).collect();
        let size_failures = kinds
            .iter()
            .filter(|k| **k == EventKind::PollingForMessageQueueSizeChangesFailed)
            .count();
        let timeout_failures = kinds
            .iter()
            .filter(|k| **k == EventKind::PollingForTimedOutMessagesFailed)
            .count();
        assert!(size_failures >= 2, "size schedule stopped after a failure");
        assert!(timeout_failures >= 2, "timeout schedule stopped after a failure");

        // No more cycles after stop.
        std::thread::sleep(Duration::from_millis(50));
        assert!(events.drain().is_empty());
    }
}
