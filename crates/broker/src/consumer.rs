//! Consumer configuration and handlers.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rmb_core::ConsumerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::BrokerError;
use crate::spi::serializer::{SerializationError, from_json};
use crate::throttle::{ExponentialBackoff, ThrottlingStrategy};
use crate::worker::KeepAlive;

/// How many times a failed message is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retries {
    /// At most this many retries after the first attempt.
    Limited(u32),
    /// Retry until the handler succeeds.
    UntilSuccess,
}

impl Retries {
    /// Whether another retry is allowed after `performed` retries.
    pub fn allows(&self, performed: u32) -> bool {
        match self {
            Retries::Limited(max) => performed < *max,
            Retries::UntilSuccess => true,
        }
    }
}

impl Default for Retries {
    fn default() -> Self {
        Self::Limited(0)
    }
}

/// Consumer configuration.
///
/// Validated and turned into a [`ConsumerPolicy`] when the consumer's queue
/// is registered.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub id: ConsumerId,
    /// Maximum number of messages processed concurrently
    pub messages_handled_in_parallel: usize,
    pub retries: Retries,
    /// Retry pacing; `None` selects exponential backoff capped at one minute
    pub throttling_strategy: Option<Arc<dyn ThrottlingStrategy>>,
    /// How long a message may stay in processing without a status write
    pub timeout: Duration,
}

impl ConsumerConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

    pub fn new(id: ConsumerId) -> Self {
        Self {
            id,
            messages_handled_in_parallel: 1,
            retries: Retries::default(),
            throttling_strategy: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_messages_handled_in_parallel(mut self, parallel: usize) -> Self {
        self.messages_handled_in_parallel = parallel;
        self
    }

    pub fn with_retries(mut self, retries: Retries) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_throttling_strategy(mut self, strategy: impl ThrottlingStrategy + 'static) -> Self {
        self.throttling_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate and fill in defaults.
    pub fn resolve(self) -> Result<ConsumerPolicy, BrokerError> {
        if self.messages_handled_in_parallel == 0 {
            return Err(BrokerError::configuration(format!(
                "consumer {}: messages_handled_in_parallel must be at least 1",
                self.id
            )));
        }
        if self.timeout.is_zero() {
            return Err(BrokerError::configuration(format!(
                "consumer {}: timeout must be greater than zero",
                self.id
            )));
        }

        let throttling_strategy = self
            .throttling_strategy
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::up_to(Self::DEFAULT_BACKOFF_CAP)));

        Ok(ConsumerPolicy {
            id: self.id,
            messages_handled_in_parallel: self.messages_handled_in_parallel,
            retries: self.retries,
            throttling_strategy,
            timeout: self.timeout,
        })
    }
}

/// Validated, immutable consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerPolicy {
    id: ConsumerId,
    messages_handled_in_parallel: usize,
    retries: Retries,
    throttling_strategy: Arc<dyn ThrottlingStrategy>,
    timeout: Duration,
}

impl ConsumerPolicy {
    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn messages_handled_in_parallel(&self) -> usize {
        self.messages_handled_in_parallel
    }

    pub fn retries(&self) -> Retries {
        self.retries
    }

    pub fn throttling_strategy(&self) -> &dyn ThrottlingStrategy {
        self.throttling_strategy.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

type PlainHandler<M> = dyn Fn(&M) -> anyhow::Result<()> + Send + Sync;
type KeepAliveHandler<M> = dyn Fn(&M, &KeepAlive) -> anyhow::Result<()> + Send + Sync;

enum Handler<M> {
    Plain(Arc<PlainHandler<M>>),
    WithKeepAlive(Arc<KeepAliveHandler<M>>),
}

impl<M> Clone for Handler<M> {
    fn clone(&self) -> Self {
        match self {
            Handler::Plain(h) => Handler::Plain(h.clone()),
            Handler::WithKeepAlive(h) => Handler::WithKeepAlive(h.clone()),
        }
    }
}

/// A consumer of messages of type `M`.
pub struct MessageConsumer<M> {
    config: ConsumerConfig,
    handler: Handler<M>,
}

impl<M> MessageConsumer<M> {
    pub fn new<F>(config: ConsumerConfig, handler: F) -> Self
    where
        F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            config,
            handler: Handler::Plain(Arc::new(handler)),
        }
    }

    /// A consumer whose handler can refresh the processing timestamp while
    /// it works.
    pub fn with_keep_alive<F>(config: ConsumerConfig, handler: F) -> Self
    where
        F: Fn(&M, &KeepAlive) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            config,
            handler: Handler::WithKeepAlive(Arc::new(handler)),
        }
    }

    pub fn id(&self) -> &ConsumerId {
        &self.config.id
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Validate the configuration and pair the handler with its policy.
    pub(crate) fn register(self) -> Result<RegisteredConsumer<M>, BrokerError> {
        Ok(RegisteredConsumer {
            policy: self.config.resolve()?,
            handler: self.handler,
            _message: PhantomData,
        })
    }
}

impl<M> Clone for MessageConsumer<M> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<M> core::fmt::Debug for MessageConsumer<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handler bound to one decoded message.
pub(crate) type BoundHandler<'a> = Box<dyn Fn(&KeepAlive) -> anyhow::Result<()> + 'a>;

/// Type-erased consumer as seen by pollers and workers.
pub(crate) trait ConsumerDispatch: Send + Sync {
    fn policy(&self) -> &ConsumerPolicy;

    /// Decode `message` into the consumer's type.
    fn bind(&self, message: &JsonValue) -> Result<BoundHandler<'_>, SerializationError>;
}

pub(crate) struct RegisteredConsumer<M> {
    policy: ConsumerPolicy,
    handler: Handler<M>,
    _message: PhantomData<fn(M)>,
}

impl<M> ConsumerDispatch for RegisteredConsumer<M>
where
    M: DeserializeOwned + 'static,
{
    fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    fn bind(&self, message: &JsonValue) -> Result<BoundHandler<'_>, SerializationError> {
        let decoded: M = from_json(message)?;
        let bound: BoundHandler<'_> = match &self.handler {
            Handler::Plain(handler) => Box::new(move |_keep_alive: &KeepAlive| handler(&decoded)),
            Handler::WithKeepAlive(handler) => {
                Box::new(move |keep_alive: &KeepAlive| handler(&decoded, keep_alive))
            }
        };
        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::NoThrottling;

    fn id() -> ConsumerId {
        ConsumerId::new("billing").unwrap()
    }

    #[test]
    fn defaults_resolve_to_backoff_capped_at_one_minute() {
        let policy = ConsumerConfig::new(id()).resolve().unwrap();

        assert_eq!(policy.messages_handled_in_parallel(), 1);
        assert_eq!(policy.retries(), Retries::Limited(0));
        assert_eq!(policy.timeout(), Duration::from_secs(60));
        assert_eq!(policy.throttling_strategy().delay(1), Duration::from_secs(1));
        assert_eq!(policy.throttling_strategy().delay(20), Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_parallel = ConsumerConfig::new(id()).with_messages_handled_in_parallel(0);
        assert!(matches!(zero_parallel.resolve(), Err(BrokerError::Configuration(_))));

        let zero_timeout = ConsumerConfig::new(id()).with_timeout(Duration::ZERO);
        assert!(matches!(zero_timeout.resolve(), Err(BrokerError::Configuration(_))));
    }

    #[test]
    fn strategy_does_not_change_the_retry_count() {
        let policy = ConsumerConfig::new(id())
            .with_retries(Retries::Limited(3))
            .with_throttling_strategy(NoThrottling)
            .resolve()
            .unwrap();

        assert_eq!(policy.retries(), Retries::Limited(3));
        assert_eq!(policy.throttling_strategy().delay(2), Duration::ZERO);
    }

    #[test]
    fn retry_budget() {
        assert!(!Retries::Limited(0).allows(0));
        assert!(Retries::Limited(2).allows(1));
        assert!(!Retries::Limited(2).allows(2));
        assert!(Retries::UntilSuccess.allows(u32::MAX));
    }

    #[test]
    fn bind_decodes_into_the_consumer_type() {
        let registered = MessageConsumer::new(ConsumerConfig::new(id()), |n: &u32| {
            anyhow::ensure!(*n == 7, "unexpected {n}");
            Ok(())
        })
        .register()
        .unwrap();

        assert!(registered.bind(&serde_json::json!("seven")).is_err());
        let handler = registered.bind(&serde_json::json!(7)).unwrap();
        assert!(handler(&KeepAlive::detached()).is_ok());
    }
}
