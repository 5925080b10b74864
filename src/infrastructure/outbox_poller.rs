use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{message_key, OutboxEvent, OutboxRow, OutboxStatus};
use crate::infrastructure::kafka_abstraction::BrokerError;
use crate::infrastructure::outbox::{OutboxError, OutboxStore};
use crate::infrastructure::publisher::EventPublisher;

#[derive(Clone, Debug)]
pub struct OutboxPollerConfig {
    pub topic: String,
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Upper bound for one row's publish, retries included.
    pub publish_timeout: Duration,
    /// Failed publishes after which a row is parked as `DEAD_LETTER`.
    /// `None` keeps retrying forever.
    pub max_publish_attempts: Option<u32>,
}

impl Default for OutboxPollerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            publish_timeout: Duration::from_secs(9),
            max_publish_attempts: None,
        }
    }
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl OutboxPollerConfig {
    /// Raises values that would stall the worker to the smallest usable ones.
    pub fn normalized(mut self) -> Self {
        if self.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "Outbox poll interval {:?} for {} is too small, using {:?}",
                self.poll_interval, self.topic, MIN_POLL_INTERVAL
            );
            self.poll_interval = MIN_POLL_INTERVAL;
        }
        if self.batch_size < 1 {
            warn!(
                "Outbox batch size {} for {} is not positive, using 1",
                self.batch_size, self.topic
            );
            self.batch_size = 1;
        }
        if self.publish_timeout.is_zero() {
            warn!("Outbox publish timeout for {} is zero, using 1ms", self.topic);
            self.publish_timeout = Duration::from_millis(1);
        }
        if self.max_publish_attempts == Some(0) {
            self.max_publish_attempts = Some(1);
        }
        self
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to fetch outbox rows: {0}")]
    Fetch(#[source] OutboxError),
}

/// Outcome of one drain pass. Only used for logs and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Rows whose publish was abandoned because of shutdown. Left untouched.
    pub interrupted: usize,
    pub first_error: Option<String>,
}

impl TickReport {
    fn record_error(&mut self, error: impl ToString) {
        if self.first_error.is_none() {
            self.first_error = Some(error.to_string());
        }
    }
}

#[derive(Error, Debug)]
enum RowFailure {
    #[error("undecodable payload: {0}")]
    Poisoned(#[from] serde_json::Error),
    #[error("{0}")]
    Broker(#[from] BrokerError),
    #[error("publish timed out after {0:?}")]
    TimedOut(Duration),
}

/// Drains one outbox table to one topic.
pub struct EventPublisherWorker<E> {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxPollerConfig,
    _event: PhantomData<fn() -> E>,
}

impl<E: OutboxEvent> EventPublisherWorker<E> {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxPollerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config: config.normalized(),
            _event: PhantomData,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "{} publisher started: topic={}, interval={:?}, batch={}",
            E::NAME,
            self.config.topic,
            self.config.poll_interval,
            self.config.batch_size
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Not raced against cancellation: a started batch runs to completion.
            match self.drain_once(&cancel).await {
                Ok(report) if report.fetched > 0 => info!(
                    "{} tick: fetched={} published={} failed={} dead_lettered={} interrupted={}",
                    E::NAME,
                    report.fetched,
                    report.published,
                    report.failed,
                    report.dead_lettered,
                    report.interrupted
                ),
                Ok(_) => {}
                Err(e) => error!("{} tick aborted: {}", E::NAME, e),
            }
        }

        info!("{} publisher stopped", E::NAME);
    }

    pub async fn drain_once(&self, cancel: &CancellationToken) -> Result<TickReport, WorkerError> {
        let rows = match self.store.fetch_eligible(self.config.batch_size).await {
            Ok(rows) => rows,
            Err(OutboxError::NoneEligible) => {
                debug!("No eligible {} rows", E::NAME);
                return Ok(TickReport::default());
            }
            Err(e) => return Err(WorkerError::Fetch(e)),
        };

        let mut report = TickReport {
            fetched: rows.len(),
            ..TickReport::default()
        };

        for row in rows {
            match self.publish_row(&row, cancel).await {
                Ok(()) => {
                    report.published += 1;
                    self.write_status(&row, OutboxStatus::Success, &mut report).await;
                }
                Err(RowFailure::Broker(BrokerError::Cancelled)) => {
                    info!("{} row {} left for the next run: shutting down", E::NAME, row.key);
                    report.interrupted += 1;
                }
                Err(failure) => {
                    let status = self.failure_status(&row);
                    warn!(
                        "Failed to publish {} row {} (attempt {}): {}. Marking {}",
                        E::NAME,
                        row.key,
                        row.attempts + 1,
                        failure,
                        status
                    );
                    match status {
                        OutboxStatus::DeadLetter => report.dead_lettered += 1,
                        _ => report.failed += 1,
                    }
                    report.record_error(&failure);
                    self.write_status(&row, status, &mut report).await;
                }
            }
        }

        Ok(report)
    }

    async fn publish_row(&self, row: &OutboxRow, cancel: &CancellationToken) -> Result<(), RowFailure> {
        let payload: E::Payload = serde_json::from_value(row.payload.clone())?;
        let value = serde_json::to_vec(&payload)?;
        let key = message_key(row.key);

        let publish = self
            .publisher
            .publish(&self.config.topic, &key, &value, cancel);
        match tokio::time::timeout(self.config.publish_timeout, publish).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RowFailure::TimedOut(self.config.publish_timeout)),
        }
    }

    fn failure_status(&self, row: &OutboxRow) -> OutboxStatus {
        match self.config.max_publish_attempts {
            Some(max) if i64::from(row.attempts) + 1 >= i64::from(max) => OutboxStatus::DeadLetter,
            _ => OutboxStatus::Failed,
        }
    }

    async fn write_status(&self, row: &OutboxRow, status: OutboxStatus, report: &mut TickReport) {
        if let Err(e) = self.store.update_status(row.key, status).await {
            // Published but not marked: the row is sent again next tick.
            error!(
                "Failed to mark {} row {} as {}: {}",
                E::NAME,
                row.key,
                status,
                e
            );
            report.record_error(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PwdVersionChanged, SellerCreated};
    use crate::infrastructure::outbox::MockOutboxStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::predicate::eq;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Vec<u8>, Vec<u8>)>>,
        fail_keys: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            key: &[u8],
            value: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), BrokerError> {
            if self.fail_keys.iter().any(|k| k == key) {
                return Err(BrokerError::Producer("broker down".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_vec(), value.to_vec()));
            Ok(())
        }
    }

    struct StallingPublisher;

    #[async_trait]
    impl EventPublisher for StallingPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _key: &[u8],
            _value: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), BrokerError> {
            std::future::pending().await
        }
    }

    fn row(key: i64, payload: serde_json::Value, attempts: i32) -> OutboxRow {
        OutboxRow {
            key,
            payload,
            status: if attempts == 0 {
                OutboxStatus::Pending
            } else {
                OutboxStatus::Failed
            },
            processed: true,
            attempts,
            created_at: Utc::now(),
        }
    }

    fn pwd_row(user_id: i64, attempts: i32) -> OutboxRow {
        row(user_id, json!({"user_id": user_id, "pwd_version": 4}), attempts)
    }

    fn config(max_publish_attempts: Option<u32>) -> OutboxPollerConfig {
        OutboxPollerConfig {
            topic: "pwd-version".to_string(),
            max_publish_attempts,
            ..OutboxPollerConfig::default()
        }
    }

    #[tokio::test]
    async fn idle_tick_publishes_nothing() {
        let mut store = MockOutboxStore::new();
        store
            .expect_fetch_eligible()
            .returning(|_| Err(OutboxError::NoneEligible));
        store.expect_update_status().never();
        let publisher = Arc::new(RecordingPublisher::default());

        let worker = EventPublisherWorker::<PwdVersionChanged>::new(
            Arc::new(store),
            publisher.clone(),
            config(None),
        );
        let report = worker.drain_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, TickReport::default());
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_tick() {
        let mut store = MockOutboxStore::new();
        store
            .expect_fetch_eligible()
            .returning(|_| Err(OutboxError::Database(sqlx::Error::PoolTimedOut)));
        store.expect_update_status().never();

        let worker = EventPublisherWorker::<PwdVersionChanged>::new(
            Arc::new(store),
            Arc::new(RecordingPublisher::default()),
            config(None),
        );
        let result = worker.drain_once(&CancellationToken::new()).await;

        assert!(matches!(result, Err(WorkerError::Fetch(OutboxError::Database(_)))));
    }

    #[tokio::test]
    async fn one_poisoned_row_does_not_block_the_batch() {
        let mut store = MockOutboxStore::new();
        store.expect_fetch_eligible().with(eq(10)).returning(|_| {
            Ok(vec![
                pwd_row(1, 0),
                row(2, json!({"user_id": "not-a-number"}), 0),
                pwd_row(3, 0),
            ])
        });
        store
            .expect_update_status()
            .with(eq(1), eq(OutboxStatus::Success))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_update_status()
            .with(eq(2), eq(OutboxStatus::Failed))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_update_status()
            .with(eq(3), eq(OutboxStatus::Success))
            .times(1)
            .returning(|_, _| Ok(()));
        let publisher = Arc::new(RecordingPublisher::default());

        let worker = EventPublisherWorker::<PwdVersionChanged>::new(
            Arc::new(store),
            publisher.clone(),
            config(None),
        );
        let report = worker.drain_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);
        assert!(report.first_error.unwrap().contains("undecodable payload"));

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "pwd-version");
        assert_eq!(sent[0].1, b"1".to_vec());
        let body: serde_json::Value = serde_json::from_slice(&sent[1].2).unwrap();
        assert_eq!(body, json!({"user_id": 3, "pwd_version": 4}));
    }

    #[tokio::test]
    async fn broker_failure_marks_failed_until_the_limit() {
        let mut store = MockOutboxStore::new();
        store
            .expect_fetch_eligible()
            .returning(|_| Ok(vec![pwd_row(1, 0), pwd_row(2, 2)]));
        store
            .expect_update_status()
            .with(eq(1), eq(OutboxStatus::Failed))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_update_status()
            .with(eq(2), eq(OutboxStatus::DeadLetter))
            .times(1)
            .returning(|_, _| Ok(()));
        let publisher = Arc::new(RecordingPublisher {
            fail_keys: vec![b"1".to_vec(), b"2".to_vec()],
            ..RecordingPublisher::default()
        });

        let worker = EventPublisherWorker::<PwdVersionChanged>::new(
            Arc::new(store),
            publisher,
            config(Some(3)),
        );
        let report = worker.drain_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.first_error.as_deref(), Some("Producer error: broker down"));
    }

    #[tokio::test]
    async fn unlimited_attempts_never_dead_letter() {
        let mut store = MockOutboxStore::new();
        store
            .expect_fetch_eligible()
            .returning(|_| Ok(vec![pwd_row(1, 500)]));
        store
            .expect_update_status()
            .with(eq(1), eq(OutboxStatus::Failed))
            .times(1)
            .returning(|_, _| Ok(()));
        let publisher = Arc::new(RecordingPublisher {
            fail_keys: vec![b"1".to_vec()],
            ..RecordingPublisher::default()
        });

        let worker =
            EventPublisherWorker::<PwdVersionChanged>::new(Arc::new(store), publisher, config(None));
        let report = worker.drain_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.dead_lettered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_publish_times_out_as_failure() {
        let mut store = MockOutboxStore::new();
        store.expect_fetch_eligible().returning(|_| {
            Ok(vec![row(5, json!({"seller_id": 5, "user_id": 9}), 0)])
        });
        store
            .expect_update_status()
            .with(eq(5), eq(OutboxStatus::Failed))
            .times(1)
            .returning(|_, _| Ok(()));

        let worker = EventPublisherWorker::<SellerCreated>::new(
            Arc::new(store),
            Arc::new(StallingPublisher),
            OutboxPollerConfig {
                topic: "seller-created".to_string(),
                publish_timeout: Duration::from_secs(9),
                ..OutboxPollerConfig::default()
            },
        );
        let report = worker.drain_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(report.first_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn status_write_failure_is_reported_not_fatal() {
        let mut store = MockOutboxStore::new();
        store
            .expect_fetch_eligible()
            .returning(|_| Ok(vec![pwd_row(1, 0), pwd_row(2, 0)]));
        store
            .expect_update_status()
            .with(eq(1), eq(OutboxStatus::Success))
            .returning(|key, _| Err(OutboxError::NotFound(key)));
        store
            .expect_update_status()
            .with(eq(2), eq(OutboxStatus::Success))
            .returning(|_, _| Ok(()));

        let worker = EventPublisherWorker::<PwdVersionChanged>::new(
            Arc::new(store),
            Arc::new(RecordingPublisher::default()),
            config(None),
        );
        let report = worker.drain_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.published, 2);
        assert_eq!(
            report.first_error.as_deref(),
            Some("Outbox row not found for key: 1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_after_cancellation() {
        let mut store = MockOutboxStore::new();
        store
            .expect_fetch_eligible()
            .returning(|_| Err(OutboxError::NoneEligible));

        let worker = EventPublisherWorker::<PwdVersionChanged>::new(
            Arc::new(store),
            Arc::new(RecordingPublisher::default()),
            config(None),
        );
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(60), worker.run(cancel))
            .await
            .unwrap();
    }

    #[test]
    fn normalized_config_raises_unusable_values() {
        let config = OutboxPollerConfig {
            topic: "pwd-version".to_string(),
            poll_interval: Duration::ZERO,
            batch_size: -5,
            publish_timeout: Duration::ZERO,
            max_publish_attempts: Some(0),
        }
        .normalized();

        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.publish_timeout, Duration::from_millis(1));
        assert_eq!(config.max_publish_attempts, Some(1));
        assert_eq!(OutboxPollerConfig::default().normalized().batch_size, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_and_batch_still_poll() {
        let mut store = MockOutboxStore::new();
        store
            .expect_fetch_eligible()
            .with(eq(1))
            .returning(|_| Err(OutboxError::NoneEligible));

        let worker = EventPublisherWorker::<PwdVersionChanged>::new(
            Arc::new(store),
            Arc::new(RecordingPublisher::default()),
            OutboxPollerConfig {
                poll_interval: Duration::ZERO,
                batch_size: 0,
                ..config(None)
            },
        );
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });

        let run = tokio::spawn(async move { worker.run(cancel).await });
        tokio::time::timeout(Duration::from_secs(60), run)
            .await
            .unwrap()
            .unwrap();
    }
}
