use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::Level;

use crate::infrastructure::backoff::RetryPolicy;
use crate::infrastructure::event_consumer::CommitPolicy;
use crate::infrastructure::kafka_config::KafkaConfig;
use crate::infrastructure::logging::LoggingConfig;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Which service this process runs as. Decides the workers and consumers started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Auth,
    User,
    Product,
    Order,
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Kafka,
    /// Process-local broker, for running a single service without Kafka.
    Memory,
}

#[derive(Debug, Clone)]
pub struct TopicNames {
    pub pwd_version: String,
    pub seller_created: String,
    pub order_created: String,
    pub order_validated: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            pwd_version: "auth.change_password".to_string(),
            seller_created: "user.create_seller".to_string(),
            order_created: "order.create_order".to_string(),
            order_validated: "product.validate_order".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub publish_timeout: Duration,
    pub max_publish_attempts: Option<u32>,
    pub publish_retry: RetryPolicy,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            publish_timeout: Duration::from_secs(9),
            max_publish_attempts: None,
            publish_retry: RetryPolicy::fixed(3, Duration::from_millis(500)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group_id: Option<String>,
    pub commit_policy: CommitPolicy,
    pub handler_retry: RetryPolicy,
    pub read_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_id: None,
            commit_policy: CommitPolicy::AfterSuccess,
            handler_retry: RetryPolicy::exponential(
                5,
                Duration::from_millis(200),
                Duration::from_secs(5),
            )
            .with_jitter(0.2),
            read_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub role: ServiceRole,
    pub database_url: Option<String>,
    pub database_pool_size: u32,
    pub run_migrations: bool,
    pub redis_url: String,
    pub broker: BrokerKind,
    pub kafka: KafkaConfig,
    pub topics: TopicNames,
    pub outbox: OutboxSettings,
    pub consumer: ConsumerSettings,
    pub pwd_version_ttl: Duration,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            role: ServiceRole::Gateway,
            database_url: None,
            database_pool_size: 10,
            run_migrations: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            broker: BrokerKind::Kafka,
            kafka: KafkaConfig::default(),
            topics: TopicNames::default(),
            outbox: OutboxSettings::default(),
            consumer: ConsumerSettings::default(),
            pwd_version_ttl: Duration::from_secs(5 * 60),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Environment lookups behind a closure so tests need not touch the process env.
struct Source<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn string(&self, key: &'static str, target: &mut String) {
        if let Some(value) = (self.lookup)(key) {
            *target = value;
        }
    }

    fn parsed<T: FromStr>(&self, key: &'static str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = (self.lookup)(key) {
            *target = parse(key, &value)?;
        }
        Ok(())
    }

    /// Like `parsed`, but values below `min` are rejected as invalid.
    fn parsed_at_least<T: FromStr + PartialOrd>(
        &self,
        key: &'static str,
        min: T,
        target: &mut T,
    ) -> Result<(), ConfigError> {
        if let Some(value) = (self.lookup)(key) {
            let parsed: T = parse(key, &value)?;
            if parsed < min {
                return Err(ConfigError::Invalid { key, value });
            }
            *target = parsed;
        }
        Ok(())
    }

    fn millis(&self, key: &'static str, target: &mut Duration) -> Result<(), ConfigError> {
        self.millis_at_least(key, 0, target)
    }

    fn millis_at_least(
        &self,
        key: &'static str,
        min_ms: u64,
        target: &mut Duration,
    ) -> Result<(), ConfigError> {
        let mut ms = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
        self.parsed_at_least(key, min_ms, &mut ms)?;
        *target = Duration::from_millis(ms);
        Ok(())
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let src = Source { lookup };
        let mut config = Self::default();

        let role = (src.lookup)("SERVICE_ROLE").ok_or(ConfigError::Missing("SERVICE_ROLE"))?;
        config.role = parse("SERVICE_ROLE", &role)?;

        config.database_url = (src.lookup)("DATABASE_URL");
        src.parsed("DATABASE_POOL_SIZE", &mut config.database_pool_size)?;
        src.parsed("RUN_MIGRATIONS", &mut config.run_migrations)?;
        src.string("REDIS_URL", &mut config.redis_url);
        src.parsed("BROKER_TRANSPORT", &mut config.broker)?;

        let kafka = &mut config.kafka;
        src.string("KAFKA_BOOTSTRAP_SERVERS", &mut kafka.bootstrap_servers);
        src.string("KAFKA_CLIENT_ID", &mut kafka.client_id);
        src.string("KAFKA_PARTITIONER", &mut kafka.partitioner);
        src.parsed("KAFKA_TOPIC_PARTITIONS", &mut kafka.topic_partitions)?;
        src.parsed("KAFKA_REPLICATION_FACTOR", &mut kafka.replication_factor)?;
        src.string("KAFKA_AUTO_OFFSET_RESET", &mut kafka.auto_offset_reset);
        src.string("KAFKA_SECURITY_PROTOCOL", &mut kafka.security_protocol);
        kafka.sasl_mechanism = (src.lookup)("KAFKA_SASL_MECHANISM");
        kafka.sasl_username = (src.lookup)("KAFKA_SASL_USERNAME");
        kafka.sasl_password = (src.lookup)("KAFKA_SASL_PASSWORD");
        kafka.ssl_ca_location = (src.lookup)("KAFKA_SSL_CA_LOCATION");

        let topics = &mut config.topics;
        src.string("TOPIC_PWD_VERSION", &mut topics.pwd_version);
        src.string("TOPIC_SELLER_CREATED", &mut topics.seller_created);
        src.string("TOPIC_ORDER_CREATED", &mut topics.order_created);
        src.string("TOPIC_ORDER_VALIDATED", &mut topics.order_validated);

        let outbox = &mut config.outbox;
        src.millis_at_least("OUTBOX_POLL_INTERVAL_MS", 1, &mut outbox.poll_interval)?;
        src.parsed_at_least("OUTBOX_BATCH_SIZE", 1, &mut outbox.batch_size)?;
        src.millis_at_least("OUTBOX_PUBLISH_TIMEOUT_MS", 1, &mut outbox.publish_timeout)?;
        if (src.lookup)("OUTBOX_MAX_PUBLISH_ATTEMPTS").is_some() {
            let mut max = 1;
            src.parsed_at_least("OUTBOX_MAX_PUBLISH_ATTEMPTS", 1, &mut max)?;
            outbox.max_publish_attempts = Some(max);
        }
        src.parsed("PUBLISH_RETRY_ATTEMPTS", &mut outbox.publish_retry.max_attempts)?;
        let mut backoff = outbox.publish_retry.base_delay;
        src.millis("PUBLISH_RETRY_BACKOFF_MS", &mut backoff)?;
        outbox.publish_retry = RetryPolicy::fixed(outbox.publish_retry.max_attempts, backoff);

        let consumer = &mut config.consumer;
        consumer.group_id = (src.lookup)("CONSUMER_GROUP");
        src.parsed("CONSUMER_COMMIT_POLICY", &mut consumer.commit_policy)?;
        src.parsed("CONSUMER_HANDLER_ATTEMPTS", &mut consumer.handler_retry.max_attempts)?;
        src.millis("CONSUMER_READ_BACKOFF_MS", &mut consumer.read_backoff)?;

        let mut ttl_secs = config.pwd_version_ttl.as_secs();
        src.parsed("PWD_VERSION_TTL_SECS", &mut ttl_secs)?;
        config.pwd_version_ttl = Duration::from_secs(ttl_secs);

        let logging = &mut config.logging;
        src.string("LOG_DIR", &mut logging.log_dir);
        src.string("LOG_FILE_PREFIX", &mut logging.file_prefix);
        src.parsed("LOG_MAX_FILES", &mut logging.max_files)?;
        src.parsed("LOG_CONSOLE", &mut logging.enable_console)?;
        src.parsed("LOG_FILE", &mut logging.enable_file)?;
        src.parsed("LOG_JSON", &mut logging.enable_json)?;
        if let Some(value) = (src.lookup)("LOG_LEVEL") {
            logging.log_level = Level::from_str(&value).map_err(|_| ConfigError::Invalid {
                key: "LOG_LEVEL",
                value,
            })?;
        }

        if config.broker == BrokerKind::Kafka && config.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigError::Missing("KAFKA_BOOTSTRAP_SERVERS"));
        }
        Ok(config)
    }

    /// Consumer group for this process: explicit setting, else the role name.
    pub fn consumer_group(&self) -> String {
        self.consumer
            .group_id
            .clone()
            .unwrap_or_else(|| format!("{}-service", self.role))
    }

    pub fn needs_database(&self) -> bool {
        self.role != ServiceRole::Gateway
    }
}
