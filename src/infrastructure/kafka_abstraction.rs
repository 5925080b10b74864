use async_trait::async_trait;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
    Message, Offset, TopicPartitionList,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::infrastructure::kafka_config::KafkaConfig;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Producer error: {0}")]
    Producer(String),
    #[error("Consumer error: {0}")]
    Consumer(String),
    #[error("Commit error: {0}")]
    Commit(String),
    #[error("Topic administration error: {0}")]
    Admin(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Channel closed: {0}")]
    Closed(String),
}

impl From<KafkaError> for BrokerError {
    fn from(error: KafkaError) -> Self {
        match error {
            KafkaError::ClientCreation(e) => BrokerError::Connection(e),
            KafkaError::MessageProduction(code) => BrokerError::Producer(code.to_string()),
            KafkaError::MessageConsumption(code) => BrokerError::Consumer(code.to_string()),
            KafkaError::ConsumerCommit(code) => BrokerError::Commit(code.to_string()),
            KafkaError::AdminOp(code) => BrokerError::Admin(code.to_string()),
            other => BrokerError::Connection(other.to_string()),
        }
    }
}

/// A message received from a topic, detached from the client that read it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn from_kafka<M: Message>(message: &M) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
        }
    }
}

/// Outbound channel bound to one topic.
#[async_trait]
pub trait TopicWriter: Send + Sync {
    fn topic(&self) -> &str;
    async fn send(&self, key: &[u8], payload: &[u8]) -> Result<(), BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Inbound channel bound to one (topic, consumer group).
#[async_trait]
pub trait TopicReader: Send + Sync {
    /// Waits for the next message. Cancel-safe: dropping the future loses nothing.
    async fn next_message(&self) -> Result<BrokerMessage, BrokerError>;
    /// Commits the position just past `message`.
    async fn commit(&self, message: &BrokerMessage) -> Result<(), BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Factory for broker channels. The registry caches what it returns.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn open_writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, BrokerError>;
    async fn open_reader(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Arc<dyn TopicReader>, BrokerError>;
}

pub struct KafkaTransport {
    config: KafkaConfig,
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl KafkaTransport {
    pub fn new(config: KafkaConfig) -> Result<Self, BrokerError> {
        let admin: AdminClient<DefaultClientContext> = config.admin_config().create()?;
        Ok(Self {
            config,
            admin: Arc::new(admin),
        })
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        let admin = self.admin.clone();
        let name = topic.to_string();
        let timeout = self.config.request_timeout();
        tokio::task::spawn_blocking(move || -> Result<bool, BrokerError> {
            let metadata = admin.inner().fetch_metadata(Some(&name), timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .any(|t| t.name() == name && t.error().is_none() && !t.partitions().is_empty()))
        })
        .await
        .map_err(|e| BrokerError::Connection(format!("metadata task failed: {}", e)))?
    }

    /// Creates `topic` unless it already exists.
    pub async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
        if self.topic_exists(topic).await.unwrap_or(false) {
            debug!("Kafka topic {} already exists", topic);
            return Ok(());
        }

        let new_topic = NewTopic::new(
            topic,
            self.config.topic_partitions,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.config.request_timeout()));
        let results = self.admin.create_topics(&[new_topic], &options).await?;

        for result in results {
            match result {
                Ok(name) => info!("Created Kafka topic {}", name),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Kafka topic {} was created concurrently", name)
                }
                Err((name, code)) => {
                    return Err(BrokerError::Admin(format!(
                        "failed to create topic {}: {}",
                        name, code
                    )))
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn open_writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, BrokerError> {
        self.ensure_topic(topic).await?;
        let producer: FutureProducer = self.config.producer_config().create()?;
        info!("Opened Kafka writer for topic {}", topic);
        Ok(Arc::new(KafkaTopicWriter {
            topic: topic.to_string(),
            producer,
            send_timeout: self.config.message_timeout(),
        }))
    }

    async fn open_reader(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Arc<dyn TopicReader>, BrokerError> {
        self.ensure_topic(topic).await?;
        let consumer: StreamConsumer = self.config.consumer_config(group_id).create()?;
        consumer.subscribe(&[topic])?;
        info!(
            "Opened Kafka reader for topic {} in group {}",
            topic, group_id
        );
        Ok(Arc::new(KafkaTopicReader {
            topic: topic.to_string(),
            consumer,
            close_timeout: self.config.request_timeout(),
        }))
    }
}

pub struct KafkaTopicWriter {
    topic: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

#[async_trait]
impl TopicWriter for KafkaTopicWriter {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, key: &[u8], payload: &[u8]) -> Result<(), BrokerError> {
        self.producer
            .send(
                FutureRecord::to(&self.topic).key(key).payload(payload),
                Timeout::After(self.send_timeout),
            )
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Producer(e.to_string()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.producer
            .flush(Timeout::After(self.send_timeout))
            .map_err(BrokerError::from)
    }
}

pub struct KafkaTopicReader {
    topic: String,
    consumer: StreamConsumer,
    close_timeout: Duration,
}

#[async_trait]
impl TopicReader for KafkaTopicReader {
    async fn next_message(&self) -> Result<BrokerMessage, BrokerError> {
        let message = self.consumer.recv().await?;
        Ok(BrokerMessage::from_kafka(&message))
    }

    async fn commit(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(BrokerError::from)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Flush pending async commits before leaving the group.
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(
                "No consumer state to commit for topic {} within {:?}: {}",
                self.topic, self.close_timeout, e
            );
        }
        self.consumer.unsubscribe();
        Ok(())
    }
}
