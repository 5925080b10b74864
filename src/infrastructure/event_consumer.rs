use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::infrastructure::backoff::RetryPolicy;
use crate::infrastructure::cache::CacheError;
use crate::infrastructure::kafka_abstraction::{BrokerError, BrokerMessage, TopicReader};
use crate::infrastructure::kafka_registry::BrokerConnectionRegistry;
use crate::infrastructure::outbox::OutboxError;
use crate::infrastructure::repository::RepositoryError;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl HandlerError {
    /// Malformed input fails the same way on every delivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Decode(_))
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConsumerError {
    #[error("Consumer cancelled")]
    Cancelled,
    #[error("Reader closed: {0}")]
    Closed(String),
}

/// Side effect applied for every message on a topic. Must be idempotent:
/// delivery is at-least-once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), HandlerError>;
}

/// When the consumer commits a message's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Only once the handler succeeded. A message whose handler keeps failing
    /// is redelivered after a restart or rebalance.
    #[default]
    AfterSuccess,
    /// After every handler run, successful or not.
    Always,
}

#[derive(Debug, Clone)]
pub struct EventConsumerConfig {
    pub topic: String,
    pub group_id: String,
    pub commit_policy: CommitPolicy,
    pub handler_retry: RetryPolicy,
    /// Wait after a failed read before reading again.
    pub read_backoff: Duration,
}

impl EventConsumerConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            commit_policy: CommitPolicy::AfterSuccess,
            handler_retry: RetryPolicy::fixed(3, Duration::from_millis(500)),
            read_backoff: Duration::from_secs(1),
        }
    }
}

enum Outcome {
    Handled,
    Skipped,
    Interrupted,
}

pub struct EventConsumer {
    registry: Arc<BrokerConnectionRegistry>,
    handler: Arc<dyn MessageHandler>,
    config: EventConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        registry: Arc<BrokerConnectionRegistry>,
        handler: Arc<dyn MessageHandler>,
        config: EventConsumerConfig,
    ) -> Self {
        Self {
            registry,
            handler,
            config,
        }
    }

    /// Reads and dispatches until `cancel` fires. Only ever returns an error:
    /// `Cancelled` on shutdown, `Closed` when the reader was closed underneath.
    pub async fn run(&self, cancel: CancellationToken) -> ConsumerError {
        let topic = &self.config.topic;
        let reader = match self.open_reader(&cancel).await {
            Some(reader) => reader,
            None => return ConsumerError::Cancelled,
        };
        info!(
            "Consumer started: topic={}, group={}, commit={}",
            topic, self.config.group_id, self.config.commit_policy
        );

        loop {
            if cancel.is_cancelled() {
                return self.stopped();
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.stopped(),
                read = reader.next_message() => read,
            };

            let message = match read {
                Ok(message) => message,
                Err(BrokerError::Closed(name)) => {
                    warn!("Reader for {} closed, consumer exiting", name);
                    return ConsumerError::Closed(name);
                }
                Err(e) => {
                    error!("Failed to read from {}: {}", topic, e);
                    if !sleep_or_cancel(self.config.read_backoff, &cancel).await {
                        return self.stopped();
                    }
                    continue;
                }
            };

            let commit = match self.dispatch(&message, &cancel).await {
                Outcome::Handled => true,
                Outcome::Skipped => self.config.commit_policy == CommitPolicy::Always,
                Outcome::Interrupted => return self.stopped(),
            };
            if commit {
                if let Err(e) = reader.commit(&message).await {
                    warn!(
                        "Failed to commit {}[{}]@{}: {}",
                        message.topic, message.partition, message.offset, e
                    );
                }
            }
        }
    }

    fn stopped(&self) -> ConsumerError {
        info!("Consumer for {} stopped", self.config.topic);
        ConsumerError::Cancelled
    }

    async fn open_reader(&self, cancel: &CancellationToken) -> Option<Arc<dyn TopicReader>> {
        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                opened = self.registry.get_or_create_reader(&self.config.topic, &self.config.group_id) => opened,
            };
            match opened {
                Ok(reader) => return Some(reader),
                Err(e) => {
                    error!("Failed to open reader for {}: {}", self.config.topic, e);
                    if !sleep_or_cancel(self.config.read_backoff, cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: &BrokerMessage, cancel: &CancellationToken) -> Outcome {
        let policy = &self.config.handler_retry;
        let mut attempt = 1;
        loop {
            let error = match self.handler.handle(message).await {
                Ok(()) => {
                    debug!(
                        "Handled {}[{}]@{}",
                        message.topic, message.partition, message.offset
                    );
                    return Outcome::Handled;
                }
                Err(e) => e,
            };

            if !error.is_retryable() || !policy.should_retry(attempt) {
                error!(
                    "Skipping {}[{}]@{} after {} attempt(s): {}",
                    message.topic, message.partition, message.offset, attempt, error
                );
                return Outcome::Skipped;
            }

            let delay = policy.delay_for(attempt);
            warn!(
                "Handler failed for {}[{}]@{} (attempt {}): {}. Retrying in {:?}",
                message.topic, message.partition, message.offset, attempt, error, delay
            );
            if !sleep_or_cancel(delay, cancel).await {
                return Outcome::Interrupted;
            }
            attempt += 1;
        }
    }
}

/// False when cancelled before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
