use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info};

use crate::infrastructure::kafka_abstraction::{
    BrokerError, BrokerTransport, TopicReader, TopicWriter,
};

type Slot<T> = Arc<OnceCell<Arc<T>>>;

#[derive(Default)]
struct Channels {
    writers: HashMap<String, Slot<dyn TopicWriter>>,
    readers: HashMap<(String, String), Slot<dyn TopicReader>>,
}

/// The map lock is only held to fetch or insert a slot. Opening a channel
/// happens inside the slot, so a slow open blocks callers of that key only.
fn slot<K: Eq + Hash, T: ?Sized>(map: &mut HashMap<K, Slot<T>>, key: K) -> Slot<T> {
    map.entry(key).or_default().clone()
}

fn opened<K, T: ?Sized>(map: HashMap<K, Slot<T>>) -> impl Iterator<Item = (K, Arc<T>)> {
    map.into_iter()
        .filter_map(|(key, cell)| cell.get().cloned().map(|channel| (key, channel)))
}

/// Process-wide cache of broker channels: one writer per topic and one reader
/// per (topic, group). Construct once and share it as `Arc`.
pub struct BrokerConnectionRegistry {
    transport: Arc<dyn BrokerTransport>,
    channels: Mutex<Channels>,
}

impl BrokerConnectionRegistry {
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            transport,
            channels: Mutex::new(Channels::default()),
        }
    }

    /// Concurrent first use of a topic opens exactly one writer. A failed open
    /// leaves the slot empty and the next caller tries again.
    pub async fn get_or_create_writer(
        &self,
        topic: &str,
    ) -> Result<Arc<dyn TopicWriter>, BrokerError> {
        let cell = slot(&mut self.channels.lock().await.writers, topic.to_string());
        let writer = cell
            .get_or_try_init(|| async {
                let writer = self.transport.open_writer(topic).await?;
                info!("Registered writer for topic {}", topic);
                Ok::<_, BrokerError>(writer)
            })
            .await?;
        Ok(writer.clone())
    }

    pub async fn get_or_create_reader(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Arc<dyn TopicReader>, BrokerError> {
        let key = (topic.to_string(), group_id.to_string());
        let cell = slot(&mut self.channels.lock().await.readers, key);
        let reader = cell
            .get_or_try_init(|| async {
                let reader = self.transport.open_reader(topic, group_id).await?;
                info!("Registered reader for topic {} in group {}", topic, group_id);
                Ok::<_, BrokerError>(reader)
            })
            .await?;
        Ok(reader.clone())
    }

    pub async fn writer_count(&self) -> usize {
        let channels = self.channels.lock().await;
        channels.writers.values().filter(|cell| cell.initialized()).count()
    }

    pub async fn reader_count(&self) -> usize {
        let channels = self.channels.lock().await;
        channels.readers.values().filter(|cell| cell.initialized()).count()
    }

    /// Closes every cached channel and empties the caches. All channels are
    /// closed even when some fail; the first failure is returned.
    pub async fn close_all(&self) -> Result<(), BrokerError> {
        let Channels { writers, readers } = std::mem::take(&mut *self.channels.lock().await);
        let mut first_error = None;

        for (topic, writer) in opened(writers) {
            if let Err(e) = writer.close().await {
                error!("Failed to close writer for topic {}: {}", topic, e);
                first_error.get_or_insert(e);
            }
        }
        for ((topic, group_id), reader) in opened(readers) {
            if let Err(e) = reader.close().await {
                error!(
                    "Failed to close reader for topic {} in group {}: {}",
                    topic, group_id, e
                );
                first_error.get_or_insert(e);
            }
        }

        info!("Broker connection registry closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory_broker::InMemoryTransport;
    use async_trait::async_trait;

    #[tokio::test]
    async fn concurrent_first_use_opens_one_writer() {
        let transport = InMemoryTransport::new();
        let registry = Arc::new(BrokerConnectionRegistry::new(Arc::new(transport.clone())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create_writer("orders").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(transport.writers_opened(), 1);
        assert_eq!(registry.writer_count().await, 1);
    }

    #[tokio::test]
    async fn readers_are_keyed_by_topic_and_group() {
        let transport = InMemoryTransport::new();
        let registry = BrokerConnectionRegistry::new(Arc::new(transport.clone()));

        registry.get_or_create_reader("t", "a").await.unwrap();
        registry.get_or_create_reader("t", "a").await.unwrap();
        registry.get_or_create_reader("t", "b").await.unwrap();

        assert_eq!(transport.readers_opened(), 2);
    }

    struct FailingWriter;

    #[async_trait]
    impl TopicWriter for FailingWriter {
        fn topic(&self) -> &str {
            "broken"
        }
        async fn send(&self, _key: &[u8], _payload: &[u8]) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BrokerError> {
            Err(BrokerError::Producer("flush failed".to_string()))
        }
    }

    struct FailingCloseTransport {
        inner: InMemoryTransport,
    }

    #[async_trait]
    impl BrokerTransport for FailingCloseTransport {
        async fn open_writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, BrokerError> {
            if topic == "broken" {
                Ok(Arc::new(FailingWriter))
            } else {
                self.inner.open_writer(topic).await
            }
        }
        async fn open_reader(
            &self,
            topic: &str,
            group_id: &str,
        ) -> Result<Arc<dyn TopicReader>, BrokerError> {
            self.inner.open_reader(topic, group_id).await
        }
    }

    #[tokio::test]
    async fn close_all_reports_first_error_and_still_clears() {
        let inner = InMemoryTransport::new();
        let registry = BrokerConnectionRegistry::new(Arc::new(FailingCloseTransport {
            inner: inner.clone(),
        }));
        registry.get_or_create_writer("broken").await.unwrap();
        let healthy = registry.get_or_create_writer("healthy").await.unwrap();
        let reader = registry.get_or_create_reader("healthy", "g").await.unwrap();

        let result = registry.close_all().await;

        assert_eq!(result, Err(BrokerError::Producer("flush failed".to_string())));
        assert_eq!(registry.writer_count().await, 0);
        assert_eq!(registry.reader_count().await, 0);
        assert!(matches!(
            healthy.send(b"k", b"v").await,
            Err(BrokerError::Closed(_))
        ));
        assert_eq!(
            reader.next_message().await,
            Err(BrokerError::Closed("healthy".to_string()))
        );
    }

    struct SlowTopicTransport {
        inner: InMemoryTransport,
        slow_topic: &'static str,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl BrokerTransport for SlowTopicTransport {
        async fn open_writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, BrokerError> {
            if topic == self.slow_topic {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.open_writer(topic).await
        }
        async fn open_reader(
            &self,
            topic: &str,
            group_id: &str,
        ) -> Result<Arc<dyn TopicReader>, BrokerError> {
            if topic == self.slow_topic {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.open_reader(topic, group_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_open_of_one_topic_does_not_block_others() {
        let inner = InMemoryTransport::new();
        let registry = Arc::new(BrokerConnectionRegistry::new(Arc::new(SlowTopicTransport {
            inner: inner.clone(),
            slow_topic: "slow",
            delay: std::time::Duration::from_secs(30),
        })));
        registry.get_or_create_writer("fast").await.unwrap();

        let slow_writer = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create_writer("slow").await })
        };
        let slow_reader = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create_reader("slow", "g").await })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        registry.get_or_create_writer("fast").await.unwrap();
        registry.get_or_create_writer("other").await.unwrap();
        registry.get_or_create_reader("fast", "g").await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        slow_writer.await.unwrap().unwrap();
        slow_reader.await.unwrap().unwrap();
        assert_eq!(inner.writers_opened(), 3);
        assert_eq!(registry.writer_count().await, 3);
        assert_eq!(registry.reader_count().await, 2);
    }

    struct FlakyOpenTransport {
        inner: InMemoryTransport,
        failures_left: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl BrokerTransport for FlakyOpenTransport {
        async fn open_writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, BrokerError> {
            use std::sync::atomic::Ordering;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BrokerError::Connection("broker unreachable".to_string()));
            }
            self.inner.open_writer(topic).await
        }
        async fn open_reader(
            &self,
            topic: &str,
            group_id: &str,
        ) -> Result<Arc<dyn TopicReader>, BrokerError> {
            self.inner.open_reader(topic, group_id).await
        }
    }

    #[tokio::test]
    async fn failed_open_is_retried_on_next_use() {
        let inner = InMemoryTransport::new();
        let registry = BrokerConnectionRegistry::new(Arc::new(FlakyOpenTransport {
            inner: inner.clone(),
            failures_left: std::sync::atomic::AtomicUsize::new(1),
        }));

        assert!(matches!(
            registry.get_or_create_writer("orders").await,
            Err(BrokerError::Connection(_))
        ));
        assert_eq!(registry.writer_count().await, 0);
        registry.get_or_create_writer("orders").await.unwrap();
        assert_eq!(registry.writer_count().await, 1);
        assert_eq!(inner.writers_opened(), 1);
    }
}
