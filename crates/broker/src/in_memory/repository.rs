//! In-memory message repository for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rmb_core::{
    Clock, ConsumerId, MessageDetails, MessageId, MessageProcessingStatus,
    MessageProcessingUpdate, QueueId, State, SystemClock,
};

use crate::spi::repository::{ClaimedMessage, MessageRepository, RepositoryError};

#[derive(Debug)]
struct StoredMessage {
    details: MessageDetails,
    payload: Vec<u8>,
    statuses: HashMap<ConsumerId, MessageProcessingStatus>,
}

impl StoredMessage {
    fn is_processed(&self) -> bool {
        self.statuses.values().all(|s| s.state().is_terminal())
    }
}

#[derive(Debug, Default)]
struct Store {
    next_sequence: u64,
    /// Messages keyed by insertion order.
    messages: BTreeMap<u64, StoredMessage>,
    index: HashMap<MessageId, u64>,
}

impl Store {
    fn get_mut(&mut self, message_id: MessageId) -> Option<&mut StoredMessage> {
        let sequence = self.index.get(&message_id)?;
        self.messages.get_mut(sequence)
    }
}

/// In-memory repository.
///
/// - FIFO per queue (publication order)
/// - Claims and updates are atomic under a single lock
/// - Nothing is persisted; the host transaction does not roll writes back
pub struct InMemoryMessageRepository {
    clock: Arc<dyn Clock>,
    store: Mutex<Store>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            store: Mutex::new(Store::default()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, RepositoryError> {
        self.store
            .lock()
            .map_err(|_| RepositoryError::storage("repository lock poisoned"))
    }

    /// Current status of a message for one consumer.
    pub fn status(
        &self,
        message_id: MessageId,
        consumer_id: &ConsumerId,
    ) -> Result<Option<MessageProcessingStatus>, RepositoryError> {
        let mut store = self.lock()?;
        Ok(store
            .get_mut(message_id)
            .and_then(|m| m.statuses.get(consumer_id).cloned()))
    }

    /// Number of stored messages, processed or not.
    pub fn len(&self) -> Result<usize, RepositoryError> {
        Ok(self.lock()?.messages.len())
    }

    pub fn is_empty(&self) -> Result<bool, RepositoryError> {
        Ok(self.len()? == 0)
    }

    /// Delete messages whose every consumer reached a terminal state.
    ///
    /// Returns the number of deleted messages.
    pub fn remove_processed(&self) -> Result<usize, RepositoryError> {
        let mut store = self.lock()?;
        let processed: Vec<(u64, MessageId)> = store
            .messages
            .iter()
            .filter(|(_, m)| m.is_processed())
            .map(|(seq, m)| (*seq, m.details.message_id()))
            .collect();

        for (sequence, message_id) in &processed {
            store.messages.remove(sequence);
            store.index.remove(message_id);
        }
        Ok(processed.len())
    }
}

impl Default for InMemoryMessageRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for InMemoryMessageRepository {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryMessageRepository").finish_non_exhaustive()
    }
}

impl MessageRepository for InMemoryMessageRepository {
    fn add(
        &self,
        queue_id: &QueueId,
        consumer_ids: &[ConsumerId],
        serialized_message: Vec<u8>,
    ) -> Result<MessageId, RepositoryError> {
        let now = self.clock.now();
        let message_id = MessageId::new();
        let statuses = consumer_ids
            .iter()
            .map(|id| (id.clone(), MessageProcessingStatus::pending(now)))
            .collect();

        let mut store = self.lock()?;
        let sequence = store.next_sequence;
        store.next_sequence += 1;
        store.index.insert(message_id, sequence);
        store.messages.insert(
            sequence,
            StoredMessage {
                details: MessageDetails::new(queue_id.clone(), message_id, now),
                payload: serialized_message,
                statuses,
            },
        );
        Ok(message_id)
    }

    fn take_for_processing(
        &self,
        queue_id: &QueueId,
        consumer_id: &ConsumerId,
        max_count: usize,
    ) -> Result<Vec<ClaimedMessage>, RepositoryError> {
        let now = self.clock.now();
        let mut store = self.lock()?;
        let mut claimed = Vec::new();

        for message in store.messages.values_mut() {
            if claimed.len() >= max_count {
                break;
            }
            if message.details.queue_id() != queue_id {
                continue;
            }
            let Some(status) = message.statuses.get_mut(consumer_id) else {
                continue;
            };
            if !status.state().is_claimable() {
                continue;
            }

            let update = MessageProcessingUpdate::take(
                message.details.clone(),
                consumer_id.clone(),
                status.clone(),
                now,
            )?;
            *status = update.to_status().clone();
            claimed.push(ClaimedMessage {
                update,
                serialized_message: message.payload.clone(),
            });
        }
        Ok(claimed)
    }

    fn update(&self, update: &MessageProcessingUpdate) -> Result<bool, RepositoryError> {
        let mut store = self.lock()?;
        let message = store
            .get_mut(update.message_id())
            .ok_or(RepositoryError::NotFound(update.message_id()))?;
        let status = message.statuses.get_mut(update.consumer_id()).ok_or_else(|| {
            RepositoryError::UnknownConsumer {
                message_id: update.message_id(),
                consumer_id: update.consumer_id().clone(),
            }
        })?;

        if status.version_id() != update.from_version_id() {
            return Ok(false);
        }
        if !status.state().can_transition_to(update.to_state()) {
            return Err(rmb_core::CoreError::InvalidTransition {
                from: status.state(),
                to: update.to_state(),
            }
            .into());
        }
        *status = update.to_status().clone();
        Ok(true)
    }

    fn reclaim_timed_out(
        &self,
        consumer_id: &ConsumerId,
        timeout: Duration,
    ) -> Result<Vec<MessageProcessingUpdate>, RepositoryError> {
        let now = self.clock.now();
        let mut store = self.lock()?;
        let mut reclaimed = Vec::new();

        for message in store.messages.values_mut() {
            let Some(status) = message.statuses.get_mut(consumer_id) else {
                continue;
            };
            if !status.is_timed_out(timeout, now) {
                continue;
            }

            let timed_out = status.transition(
                State::TimedOut,
                status.retries(),
                status.error_message().map(str::to_owned),
                now,
            )?;
            let update = MessageProcessingUpdate::create(
                message.details.clone(),
                consumer_id.clone(),
                status.clone(),
                timed_out,
            )?;
            *status = update.to_status().clone();
            reclaimed.push(update);
        }
        Ok(reclaimed)
    }

    fn queue_sizes(
        &self,
        consumer_ids: &[ConsumerId],
    ) -> Result<HashMap<ConsumerId, usize>, RepositoryError> {
        let store = self.lock()?;
        let mut sizes: HashMap<ConsumerId, usize> =
            consumer_ids.iter().map(|id| (id.clone(), 0)).collect();

        for message in store.messages.values() {
            for (consumer_id, status) in &message.statuses {
                if !status.state().is_claimable() {
                    continue;
                }
                if let Some(size) = sizes.get_mut(consumer_id) {
                    *size += 1;
                }
            }
        }
        Ok(sizes)
    }
}
