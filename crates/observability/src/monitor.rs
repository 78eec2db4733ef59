use ::tracing::{debug, error, info, trace, warn};
use rmb_events::{EngineEvent, Monitor};

/// Writes every engine event as a single structured log line.
///
/// Routine lifecycle and consumption events are logged at `debug`, poll
/// requests at `trace`, reclaimed messages at `info`, retries at `warn`
/// and failures or conflicts at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl TracingMonitor {
    pub fn new() -> Self {
        Self
    }
}

impl Monitor for TracingMonitor {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::BrokerStarted => debug!("message broker started"),
            EngineEvent::BrokerStopped => debug!("message broker stopped"),
            EngineEvent::QueueCreated {
                queue_id,
                consumer_ids,
            } => debug!(
                queue_id = %queue_id,
                consumers = ?consumer_ids,
                "queue created"
            ),
            EngineEvent::MessagePublished { queue_id, message } => debug!(
                queue_id = %queue_id,
                message = %message,
                "message published"
            ),
            EngineEvent::PollingForMessages {
                max_count_by_consumer,
            } => trace!(requested = ?max_count_by_consumer, "polling for messages"),
            EngineEvent::ConsumingNewMessage { update, message } => debug!(
                queue_id = %update.queue_id(),
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                message = %message,
                "consuming new message"
            ),
            EngineEvent::ConsumingTimedOutMessage { update, message } => info!(
                queue_id = %update.queue_id(),
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                retries = update.retries(),
                message = %message,
                "consuming timed-out message"
            ),
            EngineEvent::ThrottlingMessageRetry {
                update,
                error,
                delay,
                ..
            } => debug!(
                queue_id = %update.queue_id(),
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                retries = update.retries(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "throttling message retry"
            ),
            EngineEvent::RetryingMessageConsumption { update, error, .. } => warn!(
                queue_id = %update.queue_id(),
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                retries = update.retries(),
                error = %error,
                "retrying message consumption"
            ),
            EngineEvent::MessageKeptAlive { update, .. } => debug!(
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                "message kept alive"
            ),
            EngineEvent::MessageConsumed { update, .. } => debug!(
                queue_id = %update.queue_id(),
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                retries = update.retries(),
                "message consumed"
            ),
            EngineEvent::MessageConsumptionFailed {
                update,
                message,
                error,
            } => error!(
                queue_id = %update.queue_id(),
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                retries = update.retries(),
                message = %message,
                error = %error,
                "message consumption failed"
            ),
            EngineEvent::MessageUpdateConflict { update, .. } => error!(
                queue_id = %update.queue_id(),
                consumer_id = %update.consumer_id(),
                message_id = %update.message_id(),
                state = %update.to_state(),
                "message update conflict"
            ),
            EngineEvent::PollingForMessagesFailed { error } => {
                error!(error = %error, "polling for messages failed")
            }
            EngineEvent::PollingForMessageQueueSizeChangesFailed { error } => {
                error!(error = %error, "polling for queue size changes failed")
            }
            EngineEvent::PollingForTimedOutMessagesFailed { error } => {
                error!(error = %error, "polling for timed-out messages failed")
            }
        }
    }
}
