use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    /// librdkafka partitioner used by writers (`murmur2_random`, `consistent_random`, ...).
    pub partitioner: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: i32,
    pub heartbeat_interval_ms: i32,
    pub max_poll_interval_ms: i32,
    pub request_timeout_ms: i32,
    pub message_timeout_ms: i32,
    pub producer_acks: String,
    pub linger_ms: i32,
    pub batch_size_bytes: i32,
    pub topic_partitions: i32,
    pub replication_factor: i32,
    pub security_protocol: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "market-outbox".to_string(),
            partitioner: "murmur2_random".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 10000,
            heartbeat_interval_ms: 3000,
            max_poll_interval_ms: 300000,
            request_timeout_ms: 30000,
            message_timeout_ms: 10000,
            producer_acks: "all".to_string(),
            linger_ms: 500,
            batch_size_bytes: 1_000_000,
            topic_partitions: 3,
            replication_factor: 1,
            security_protocol: "PLAINTEXT".to_string(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
        }
    }
}

impl KafkaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(0) as u64)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms.max(0) as u64)
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", &self.security_protocol);
        if let Some(mechanism) = &self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &self.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(ca) = &self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }
        config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_client_config();
        config
            .set("acks", &self.producer_acks)
            .set("partitioner", &self.partitioner)
            .set("linger.ms", self.linger_ms.to_string())
            .set("batch.size", self.batch_size_bytes.to_string())
            .set("message.timeout.ms", self.message_timeout_ms.to_string())
            .set("request.timeout.ms", self.request_timeout_ms.to_string());
        config
    }

    /// Consumers never auto-commit: offsets are committed by the consumer loop
    /// according to its commit policy.
    pub fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = self.base_client_config();
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", self.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string())
            .set("partition.assignment.strategy", "cooperative-sticky");
        config
    }

    pub fn admin_config(&self) -> ClientConfig {
        self.base_client_config()
    }
}
