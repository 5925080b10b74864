pub mod account_repository;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod event_consumer;
pub mod in_memory_broker;
pub mod kafka_abstraction;
pub mod kafka_config;
pub mod kafka_registry;
pub mod logging;
pub mod order_repository;
pub mod outbox;
pub mod outbox_poller;
pub mod product_repository;
pub mod publisher;
pub mod repository;
pub mod seller_repository;
pub mod service_clients;

pub use backoff::RetryPolicy;
pub use cache::{InMemoryCache, KeyValueCache, RedisCache};
pub use config::AppConfig;
pub use event_consumer::{CommitPolicy, EventConsumer, EventConsumerConfig, MessageHandler};
pub use in_memory_broker::InMemoryTransport;
pub use kafka_abstraction::{BrokerError, BrokerMessage, BrokerTransport, KafkaTransport};
pub use kafka_config::KafkaConfig;
pub use kafka_registry::BrokerConnectionRegistry;
pub use outbox::{InMemoryOutboxStore, OutboxError, OutboxStore, PgOutboxStore};
pub use outbox_poller::{EventPublisherWorker, OutboxPollerConfig, TickReport};
pub use publisher::{BrokerPublisher, EventPublisher};
pub use repository::RepositoryError;
