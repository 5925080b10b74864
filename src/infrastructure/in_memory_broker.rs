use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use crate::infrastructure::kafka_abstraction::{
    BrokerError, BrokerMessage, BrokerTransport, TopicReader, TopicWriter,
};

#[derive(Default)]
struct TopicLog {
    messages: Vec<BrokerMessage>,
    injected_failures: usize,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    /// Next offset to read per (topic, group).
    committed: HashMap<(String, String), i64>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    appended: Notify,
    writers_opened: AtomicUsize,
    readers_opened: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Connection("in-memory broker state poisoned".to_string()))
    }
}

/// Single-partition, process-local broker. Topics are append-only logs and
/// consumer groups resume from their committed offset.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends to `topic` fail.
    pub fn fail_next_sends(&self, topic: &str, count: usize) {
        if let Ok(mut state) = self.shared.lock() {
            state.topics.entry(topic.to_string()).or_default().injected_failures = count;
        }
    }

    /// Appends a message directly, bypassing writers and injected failures.
    pub fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<i64, BrokerError> {
        let offset = {
            let mut state = self.shared.lock()?;
            append(&mut state, topic, key, payload)
        };
        self.shared.appended.notify_waiters();
        Ok(offset)
    }

    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.shared
            .lock()
            .map(|state| {
                state
                    .topics
                    .get(topic)
                    .map(|log| log.messages.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Next offset the group will read from, if it ever committed.
    pub fn committed_offset(&self, topic: &str, group_id: &str) -> Option<i64> {
        self.shared.lock().ok().and_then(|state| {
            state
                .committed
                .get(&(topic.to_string(), group_id.to_string()))
                .copied()
        })
    }

    pub fn writers_opened(&self) -> usize {
        self.shared.writers_opened.load(Ordering::SeqCst)
    }

    pub fn readers_opened(&self) -> usize {
        self.shared.readers_opened.load(Ordering::SeqCst)
    }
}

fn append(state: &mut BrokerState, topic: &str, key: &[u8], payload: &[u8]) -> i64 {
    let log = state.topics.entry(topic.to_string()).or_default();
    let offset = log.messages.len() as i64;
    log.messages.push(BrokerMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: Some(key.to_vec()),
        payload: payload.to_vec(),
    });
    offset
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    async fn open_writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, BrokerError> {
        self.shared.writers_opened.fetch_add(1, Ordering::SeqCst);
        debug!("Opened in-memory writer for topic {}", topic);
        Ok(Arc::new(InMemoryWriter {
            topic: topic.to_string(),
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_reader(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Arc<dyn TopicReader>, BrokerError> {
        let start = {
            let state = self.shared.lock()?;
            state
                .committed
                .get(&(topic.to_string(), group_id.to_string()))
                .copied()
                .unwrap_or(0)
        };
        self.shared.readers_opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Opened in-memory reader for topic {} in group {} at offset {}",
            topic, group_id, start
        );
        Ok(Arc::new(InMemoryReader {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            shared: self.shared.clone(),
            position: AtomicI64::new(start),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryWriter {
    topic: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl TopicWriter for InMemoryWriter {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, key: &[u8], payload: &[u8]) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(self.topic.clone()));
        }
        {
            let mut state = self.shared.lock()?;
            let log = state.topics.entry(self.topic.clone()).or_default();
            if log.injected_failures > 0 {
                log.injected_failures -= 1;
                return Err(BrokerError::Producer(format!(
                    "injected failure on topic {}",
                    self.topic
                )));
            }
            append(&mut state, &self.topic, key, payload);
        }
        self.shared.appended.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryReader {
    topic: String,
    group_id: String,
    shared: Arc<Shared>,
    position: AtomicI64,
    closed: AtomicBool,
}

#[async_trait]
impl TopicReader for InMemoryReader {
    async fn next_message(&self) -> Result<BrokerMessage, BrokerError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed(self.topic.clone()));
            }
            // Registered before the check so an append in between is not missed.
            let appended = self.shared.appended.notified();
            {
                let state = self.shared.lock()?;
                let position = self.position.load(Ordering::SeqCst);
                if let Some(message) = state
                    .topics
                    .get(&self.topic)
                    .and_then(|log| log.messages.get(position as usize))
                {
                    self.position.store(position + 1, Ordering::SeqCst);
                    return Ok(message.clone());
                }
            }
            appended.await;
        }
    }

    async fn commit(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut state = self.shared.lock()?;
        state.committed.insert(
            (self.topic.clone(), self.group_id.clone()),
            message.offset + 1,
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.appended.notify_waiters();
        Ok(())
    }
}
