pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{OrderService, PwdVersionGuard};
pub use infrastructure::{
    AppConfig, BrokerConnectionRegistry, BrokerPublisher, EventConsumer, EventPublisherWorker,
    OutboxStore, PgOutboxStore,
};
