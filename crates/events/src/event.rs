//! The engine event type.
//!
//! Every observable thing the broker does is reported as one `EngineEvent`.
//! Events are notifications only: the repository stays the source of truth
//! for message state.

use std::collections::BTreeMap;
use std::time::Duration;

use rmb_core::{ConsumerId, MessageProcessingUpdate, QueueId};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// A notification emitted by the broker.
///
/// `message` fields carry the decoded payload as JSON (`Null` when the
/// stored bytes could not be decoded).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BrokerStarted,
    BrokerStopped,
    QueueCreated {
        queue_id: QueueId,
        consumer_ids: Vec<ConsumerId>,
    },
    MessagePublished {
        queue_id: QueueId,
        message: JsonValue,
    },
    /// Emitted before a poll cycle claims anything; maps each consumer to
    /// the number of slots requested.
    PollingForMessages {
        max_count_by_consumer: BTreeMap<ConsumerId, usize>,
    },
    ConsumingNewMessage {
        update: MessageProcessingUpdate,
        message: JsonValue,
    },
    ConsumingTimedOutMessage {
        update: MessageProcessingUpdate,
        message: JsonValue,
    },
    ThrottlingMessageRetry {
        update: MessageProcessingUpdate,
        message: JsonValue,
        error: String,
        delay: Duration,
    },
    RetryingMessageConsumption {
        update: MessageProcessingUpdate,
        message: JsonValue,
        error: String,
    },
    MessageKeptAlive {
        update: MessageProcessingUpdate,
        message: JsonValue,
    },
    MessageConsumed {
        update: MessageProcessingUpdate,
        message: JsonValue,
    },
    MessageConsumptionFailed {
        update: MessageProcessingUpdate,
        message: JsonValue,
        error: String,
    },
    /// A status write was rejected because the stored version moved on.
    MessageUpdateConflict {
        update: MessageProcessingUpdate,
        message: JsonValue,
    },
    PollingForMessagesFailed {
        error: String,
    },
    PollingForMessageQueueSizeChangesFailed {
        error: String,
    },
    PollingForTimedOutMessagesFailed {
        error: String,
    },
}

/// Discriminant of an [`EngineEvent`], handy for filtering.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    BrokerStarted,
    BrokerStopped,
    QueueCreated,
    MessagePublished,
    PollingForMessages,
    ConsumingNewMessage,
    ConsumingTimedOutMessage,
    ThrottlingMessageRetry,
    RetryingMessageConsumption,
    MessageKeptAlive,
    MessageConsumed,
    MessageConsumptionFailed,
    MessageUpdateConflict,
    PollingForMessagesFailed,
    PollingForMessageQueueSizeChangesFailed,
    PollingForTimedOutMessagesFailed,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::BrokerStarted => EventKind::BrokerStarted,
            EngineEvent::BrokerStopped => EventKind::BrokerStopped,
            EngineEvent::QueueCreated { .. } => EventKind::QueueCreated,
            EngineEvent::MessagePublished { .. } => EventKind::MessagePublished,
            EngineEvent::PollingForMessages { .. } => EventKind::PollingForMessages,
            EngineEvent::ConsumingNewMessage { .. } => EventKind::ConsumingNewMessage,
            EngineEvent::ConsumingTimedOutMessage { .. } => EventKind::ConsumingTimedOutMessage,
            EngineEvent::ThrottlingMessageRetry { .. } => EventKind::ThrottlingMessageRetry,
            EngineEvent::RetryingMessageConsumption { .. } => EventKind::RetryingMessageConsumption,
            EngineEvent::MessageKeptAlive { .. } => EventKind::MessageKeptAlive,
            EngineEvent::MessageConsumed { .. } => EventKind::MessageConsumed,
            EngineEvent::MessageConsumptionFailed { .. } => EventKind::MessageConsumptionFailed,
            EngineEvent::MessageUpdateConflict { .. } => EventKind::MessageUpdateConflict,
            EngineEvent::PollingForMessagesFailed { .. } => EventKind::PollingForMessagesFailed,
            EngineEvent::PollingForMessageQueueSizeChangesFailed { .. } => {
                EventKind::PollingForMessageQueueSizeChangesFailed
            }
            EngineEvent::PollingForTimedOutMessagesFailed { .. } => {
                EventKind::PollingForTimedOutMessagesFailed
            }
        }
    }

    /// The status update the event reports on, if it concerns a single message.
    pub fn update(&self) -> Option<&MessageProcessingUpdate> {
        match self {
            EngineEvent::ConsumingNewMessage { update, .. }
            | EngineEvent::ConsumingTimedOutMessage { update, .. }
            | EngineEvent::ThrottlingMessageRetry { update, .. }
            | EngineEvent::RetryingMessageConsumption { update, .. }
            | EngineEvent::MessageKeptAlive { update, .. }
            | EngineEvent::MessageConsumed { update, .. }
            | EngineEvent::MessageConsumptionFailed { update, .. }
            | EngineEvent::MessageUpdateConflict { update, .. } => Some(update),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rmb_core::{MessageDetails, MessageId, MessageProcessingStatus};

    fn update() -> MessageProcessingUpdate {
        let now = Utc::now();
        MessageProcessingUpdate::take(
            MessageDetails::new(QueueId::new("orders").unwrap(), MessageId::new(), now),
            ConsumerId::new("billing").unwrap(),
            MessageProcessingStatus::pending(now),
            now,
        )
        .unwrap()
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = EngineEvent::QueueCreated {
            queue_id: QueueId::new("orders").unwrap(),
            consumer_ids: vec![ConsumerId::new("billing").unwrap()],
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "queue_created");
        assert_eq!(json["queue_id"], "orders");
        assert_eq!(json["consumer_ids"][0], "billing");
    }

    #[test]
    fn message_events_expose_their_update() {
        let update = update();
        let event = EngineEvent::MessageConsumed {
            update: update.clone(),
            message: JsonValue::Null,
        };

        assert_eq!(event.kind(), EventKind::MessageConsumed);
        assert_eq!(event.update(), Some(&update));
        assert_eq!(EngineEvent::BrokerStarted.update(), None);
    }
}
