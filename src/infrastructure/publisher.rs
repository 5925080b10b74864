use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::infrastructure::backoff::RetryPolicy;
use crate::infrastructure::kafka_abstraction::BrokerError;
use crate::infrastructure::kafka_registry::BrokerConnectionRegistry;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Delivers one message to `topic`. Implementations may retry, but must stop
    /// waiting and return `BrokerError::Cancelled` once `cancel` fires.
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;
}

/// Publishes through the registry's cached writer for the topic, retrying
/// failed sends according to its `RetryPolicy`.
pub struct BrokerPublisher {
    registry: Arc<BrokerConnectionRegistry>,
    policy: RetryPolicy,
}

impl BrokerPublisher {
    pub fn new(registry: Arc<BrokerConnectionRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    async fn send_once(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
        let writer = self.registry.get_or_create_writer(topic).await?;
        writer.send(key, value).await
    }
}

#[async_trait]
impl EventPublisher for BrokerPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut attempt = 1;
        loop {
            let error = match self.send_once(topic, key, value).await {
                Ok(()) => {
                    debug!("Published to {} on attempt {}", topic, attempt);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !self.policy.should_retry(attempt) {
                warn!(
                    "Publish to {} failed after {} attempts: {}",
                    topic, attempt, error
                );
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "Publish to {} failed on attempt {}: {}. Retrying in {:?}",
                topic, attempt, error, delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory_broker::InMemoryTransport;
    use std::time::Duration;

    fn publisher(transport: &InMemoryTransport, attempts: u32) -> BrokerPublisher {
        let registry = Arc::new(BrokerConnectionRegistry::new(Arc::new(transport.clone())));
        BrokerPublisher::new(
            registry,
            RetryPolicy::fixed(attempts, Duration::from_millis(500)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_send_succeeds() {
        let transport = InMemoryTransport::new();
        transport.fail_next_sends("orders", 2);
        let publisher = publisher(&transport, 3);

        publisher
            .publish("orders", b"42", b"{}", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.messages("orders").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_attempts_run_out() {
        let transport = InMemoryTransport::new();
        transport.fail_next_sends("orders", 5);
        let publisher = publisher(&transport, 2);

        let result = publisher
            .publish("orders", b"42", b"{}", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(BrokerError::Producer(_))));
        assert!(transport.messages("orders").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let transport = InMemoryTransport::new();
        transport.fail_next_sends("orders", 5);
        let publisher = publisher(&transport, 5);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = publisher.publish("orders", b"42", b"{}", &cancel).await;
        assert_eq!(result, Err(BrokerError::Cancelled));
    }
}
