//! Broker facade: queue registration, publishing and lifecycle.
//!
//! ```text
//! publish ──► repository.add ──► (host commit) ──► poller.poll ──► pool ──► Worker::consume
//!                                                      ▲
//!                              watcher schedules ──────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rmb_core::{Clock, ConsumerId, MessageId, QueueId, SystemClock};
use rmb_events::{EngineEvent, Monitor, Monitors};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::consumer::{ConsumerDispatch, ConsumerPolicy, MessageConsumer};
use crate::error::BrokerError;
use crate::poller::MessagePoller;
use crate::pool::WorkerPool;
use crate::shutdown::ShutdownSignal;
use crate::spi::repository::MessageRepository;
use crate::spi::serializer::{JsonMessageSerializer, MessageSerializer, to_json};
use crate::spi::transaction::TransactionSynchronizer;
use crate::throttle::Throttler;
use crate::watcher::MessageRepositoryWatcher;
use crate::worker::WorkerContext;

#[derive(Debug, Default)]
struct Registry {
    queues: HashMap<QueueId, Vec<ConsumerId>>,
    consumer_ids: HashSet<ConsumerId>,
    /// Sum of `messages_handled_in_parallel` over every consumer.
    parallelism: usize,
}

struct ManagerInner {
    config: BrokerConfig,
    repository: Arc<dyn MessageRepository>,
    transactions: Arc<dyn TransactionSynchronizer>,
    serializer: Arc<dyn MessageSerializer>,
    monitors: Monitors,
    registry: Mutex<Registry>,
    poller: MessagePoller,
    watcher: MessageRepositoryWatcher,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Entry point of the broker.
///
/// Register every queue, call [`start`](Self::start), then publish from
/// inside host transactions. Cloning yields another handle to the same
/// broker.
#[derive(Clone)]
pub struct MessageQueueManager {
    inner: Arc<ManagerInner>,
}

/// Builder for [`MessageQueueManager`].
pub struct MessageQueueManagerBuilder {
    repository: Arc<dyn MessageRepository>,
    transactions: Arc<dyn TransactionSynchronizer>,
    serializer: Arc<dyn MessageSerializer>,
    monitors: Vec<Arc<dyn Monitor>>,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
}

impl MessageQueueManagerBuilder {
    /// Payload encoding; JSON by default.
    pub fn serializer(mut self, serializer: impl MessageSerializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Add an event sink. May be called more than once.
    pub fn monitor(mut self, monitor: impl Monitor + 'static) -> Self {
        self.monitors.push(Arc::new(monitor));
        self
    }

    /// Time source for status timestamps; the system clock by default.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<MessageQueueManager, BrokerError> {
        self.config.validate()?;

        let monitors = Monitors::new(self.monitors);
        let poller = MessagePoller::new(WorkerContext {
            repository: self.repository.clone(),
            serializer: self.serializer.clone(),
            monitors: monitors.clone(),
            clock: self.clock,
            throttler: Throttler::new(ShutdownSignal::new()),
        });
        let watcher =
            MessageRepositoryWatcher::new(self.repository.clone(), poller.clone(), monitors.clone());

        Ok(MessageQueueManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                repository: self.repository,
                transactions: self.transactions,
                serializer: self.serializer,
                monitors,
                registry: Mutex::new(Registry::default()),
                poller,
                watcher,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

impl core::fmt::Debug for MessageQueueManagerBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageQueueManagerBuilder")
            .field("monitors", &self.monitors.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessageQueueManager {
    pub fn builder(
        repository: impl MessageRepository + 'static,
        transactions: impl TransactionSynchronizer + 'static,
    ) -> MessageQueueManagerBuilder {
        MessageQueueManagerBuilder {
            repository: Arc::new(repository),
            transactions: Arc::new(transactions),
            serializer: Arc::new(JsonMessageSerializer),
            monitors: Vec::new(),
            clock: Arc::new(SystemClock),
            config: BrokerConfig::default(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a queue and its consumers.
    ///
    /// Queue ids and consumer ids are unique across the whole broker.
    /// Fails once the broker has started.
    pub fn register_queue<M>(
        &self,
        queue_id: QueueId,
        consumers: Vec<MessageConsumer<M>>,
    ) -> Result<MessageQueue<M>, BrokerError>
    where
        M: Serialize + DeserializeOwned + 'static,
    {
        if consumers.is_empty() {
            return Err(BrokerError::configuration(format!(
                "queue {queue_id}: at least one consumer is required"
            )));
        }
        let registered = consumers
            .into_iter()
            .map(MessageConsumer::register)
            .collect::<Result<Vec<_>, _>>()?;

        let mut registry = self.registry();
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }
        if registry.queues.contains_key(&queue_id) {
            return Err(BrokerError::DuplicateQueue(queue_id));
        }
        let mut seen = HashSet::new();
        for consumer in &registered {
            let id = consumer.policy().id();
            if registry.consumer_ids.contains(id) || !seen.insert(id.clone()) {
                return Err(BrokerError::DuplicateConsumer(id.clone()));
            }
        }

        let policies: Vec<ConsumerPolicy> = registered.iter().map(|c| c.policy().clone()).collect();
        let consumer_ids: Vec<ConsumerId> = policies.iter().map(|p| p.id().clone()).collect();
        registry.parallelism += policies
            .iter()
            .map(ConsumerPolicy::messages_handled_in_parallel)
            .sum::<usize>();
        registry.consumer_ids.extend(consumer_ids.iter().cloned());
        registry.queues.insert(queue_id.clone(), consumer_ids.clone());

        let dispatch: Vec<Arc<dyn ConsumerDispatch>> = registered
            .into_iter()
            .map(|c| Arc::new(c) as Arc<dyn ConsumerDispatch>)
            .collect();
        self.inner.poller.register_consumers(&queue_id, dispatch);
        self.inner.watcher.include_queue(&policies);
        drop(registry);

        info!(queue_id = %queue_id, consumers = consumer_ids.len(), "queue registered");
        self.inner.monitors.emit(EngineEvent::QueueCreated {
            queue_id: queue_id.clone(),
            consumer_ids,
        });

        Ok(MessageQueue {
            manager: self.clone(),
            queue_id,
            _message: PhantomData,
        })
    }

    /// Store `message` for every consumer of `queue_id`.
    ///
    /// Must run inside a host transaction; consumers are polled once that
    /// transaction commits.
    pub fn publish<M: Serialize>(
        &self,
        queue_id: &QueueId,
        message: &M,
    ) -> Result<MessageId, BrokerError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(BrokerError::NotStarted);
        }
        if !self.inner.transactions.is_in_transaction() {
            return Err(BrokerError::NotInTransaction);
        }
        let consumer_ids = self
            .registry()
            .queues
            .get(queue_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue_id.clone()))?;

        let message = to_json(message)?;
        let serialized = self.inner.serializer.serialize(&message)?;
        let message_id = self.inner.repository.add(queue_id, &consumer_ids, serialized)?;
        debug!(queue_id = %queue_id, message_id = %message_id, "message published");
        self.inner.monitors.emit(EngineEvent::MessagePublished {
            queue_id: queue_id.clone(),
            message,
        });

        let poller = self.inner.poller.clone();
        self.inner
            .transactions
            .notify_on_commit(Box::new(move || poller.poll()))?;
        Ok(message_id)
    }

    /// Spawn the worker pool and the watcher schedules.
    ///
    /// Calling it again is a no-op. A stopped broker cannot be restarted.
    pub fn start(&self) -> Result<(), BrokerError> {
        {
            let registry = self.registry();
            if self.inner.stopped.load(Ordering::SeqCst) {
                return Err(BrokerError::Stopped);
            }
            if self.inner.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            let pool = match WorkerPool::spawn(&self.inner.config.name, registry.parallelism.max(1))
            {
                Ok(pool) => pool,
                Err(err) => {
                    self.inner.started.store(false, Ordering::SeqCst);
                    return Err(err.into());
                }
            };
            self.inner.poller.start(pool);
            if let Err(err) = self.inner.watcher.start(&self.inner.config) {
                self.inner.poller.stop();
                self.inner.stopped.store(true, Ordering::SeqCst);
                return Err(err);
            }

            info!(
                name = %self.inner.config.name,
                queues = registry.queues.len(),
                workers = registry.parallelism.max(1),
                "message broker started"
            );
        }
        self.inner.monitors.emit(EngineEvent::BrokerStarted);

        // Pick up whatever was left claimable by a previous run.
        self.inner.poller.poll();
        Ok(())
    }

    /// Stop the watcher, stop dispatching and wait for running workers.
    ///
    /// Throttled workers are interrupted; their messages stay `PROCESSING`
    /// until reclaimed as timed out.
    pub fn stop(&self) {
        let was_started = {
            let _registry = self.registry();
            if self.inner.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            self.inner.started.load(Ordering::SeqCst)
        };
        if !was_started {
            return;
        }

        self.inner.watcher.stop();
        self.inner.poller.stop();
        self.inner.monitors.emit(EngineEvent::BrokerStopped);
        info!(name = %self.inner.config.name, "message broker stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn poller(&self) -> &MessagePoller {
        &self.inner.poller
    }

    pub fn watcher(&self) -> &MessageRepositoryWatcher {
        &self.inner.watcher
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }
}

impl core::fmt::Debug for MessageQueueManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let queues = self.registry().queues.len();
        f.debug_struct("MessageQueueManager")
            .field("name", &self.inner.config.name)
            .field("queues", &queues)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

/// Typed handle to a registered queue.
pub struct MessageQueue<M> {
    manager: MessageQueueManager,
    queue_id: QueueId,
    _message: PhantomData<fn(M)>,
}

impl<M: Serialize> MessageQueue<M> {
    pub fn id(&self) -> &QueueId {
        &self.queue_id
    }

    /// See [`MessageQueueManager::publish`].
    pub fn publish(&self, message: &M) -> Result<MessageId, BrokerError> {
        self.manager.publish(&self.queue_id, message)
    }
}

impl<M> Clone for MessageQueue<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            queue_id: self.queue_id.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> core::fmt::Debug for MessageQueue<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("queue_id", &self.queue_id)
            .finish()
    }
}
