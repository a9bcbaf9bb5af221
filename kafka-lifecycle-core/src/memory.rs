//! In-process broker.
//!
//! [`MemoryBroker`] is a [`ClientConnector`] that keeps one append-only log per topic. Consumer
//! handles read from a per-handle cursor, producer handles append to the log. Every handle
//! call is counted in [`BrokerStats`], which makes the broker usable as a test double and for
//! running a pipeline without Kafka.

use crate::{
    ClientConnector, ConsumedRecord, ConsumerHandle, ConsumerSettings, DeliveryReport,
    LifecycleError, LifecycleResult, OutgoingRecord, ProducerHandle, ProducerSettings,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Snapshot of handle calls made against a [`MemoryBroker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub consumers_connected: usize,
    pub producers_connected: usize,
    pub subscribes: usize,
    pub polls: usize,
    pub consumer_closes: usize,
    pub sends: usize,
    pub producer_closes: usize,
}

#[derive(Default)]
struct Counters {
    consumers_connected: AtomicUsize,
    producers_connected: AtomicUsize,
    subscribes: AtomicUsize,
    polls: AtomicUsize,
    consumer_closes: AtomicUsize,
    sends: AtomicUsize,
    producer_closes: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<ConsumedRecord>>,
    poll_failures: VecDeque<String>,
}

/// In-process broker with per-topic logs
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    counters: Arc<Counters>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a keyed record to a topic and return its offset
    pub fn publish(&self, topic: &str, key: impl AsRef<[u8]>, payload: impl AsRef<[u8]>) -> i64 {
        self.append(
            topic,
            Some(key.as_ref().to_vec()),
            Some(payload.as_ref().to_vec()),
        )
    }

    /// Append a record with optional key and payload and return its offset
    pub fn append(&self, topic: &str, key: Option<Vec<u8>>, payload: Option<Vec<u8>>) -> i64 {
        let mut state = self.state();
        let log = state.topics.entry(topic.to_string()).or_default();
        let offset = log.len() as i64;
        log.push(ConsumedRecord::new(topic, key, payload).with_position(0, offset));
        offset
    }

    /// All records appended to a topic so far
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        self.state().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Make the next poll on any consumer handle fail with `message`
    pub fn fail_next_poll(&self, message: impl Into<String>) {
        self.state().poll_failures.push_back(message.into());
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            consumers_connected: c.consumers_connected.load(Ordering::Acquire),
            producers_connected: c.producers_connected.load(Ordering::Acquire),
            subscribes: c.subscribes.load(Ordering::Acquire),
            polls: c.polls.load(Ordering::Acquire),
            consumer_closes: c.consumer_closes.load(Ordering::Acquire),
            sends: c.sends.load(Ordering::Acquire),
            producer_closes: c.producer_closes.load(Ordering::Acquire),
        }
    }

    /// Take every record past the cursors, in subscription order
    fn fetch(&self, topics: &[String], cursors: &mut HashMap<String, usize>) -> Vec<ConsumedRecord> {
        let state = self.state();
        let mut batch = Vec::new();
        for topic in topics {
            let Some(log) = state.topics.get(topic) else {
                continue;
            };
            let cursor = cursors.entry(topic.clone()).or_insert(0);
            batch.extend(log[*cursor..].iter().cloned());
            *cursor = log.len();
        }
        batch
    }
}

impl ClientConnector for MemoryBroker {
    fn connect_consumer(
        &self,
        settings: &ConsumerSettings,
    ) -> LifecycleResult<Box<dyn ConsumerHandle>> {
        Counters::bump(&self.counters.consumers_connected);
        debug!("Memory consumer {} connected", settings.id);
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            topics: Vec::new(),
            cursors: HashMap::new(),
            closed: false,
        }))
    }

    fn connect_producer(
        &self,
        settings: &ProducerSettings,
    ) -> LifecycleResult<Arc<dyn ProducerHandle>> {
        Counters::bump(&self.counters.producers_connected);
        debug!("Memory producer {} connected", settings.id);
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    topics: Vec<String>,
    cursors: HashMap<String, usize>,
    closed: bool,
}

#[async_trait]
impl ConsumerHandle for MemoryConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> LifecycleResult<()> {
        if self.closed {
            return Err(LifecycleError::Closed("consumer handle".to_string()));
        }
        Counters::bump(&self.broker.counters.subscribes);
        self.topics = topics.to_vec();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> LifecycleResult<Vec<ConsumedRecord>> {
        if self.closed {
            return Err(LifecycleError::Closed("consumer handle".to_string()));
        }
        Counters::bump(&self.broker.counters.polls);

        let failure = self.broker.state().poll_failures.pop_front();
        if let Some(message) = failure {
            return Err(LifecycleError::delivery(message));
        }

        let batch = self.broker.fetch(&self.topics, &mut self.cursors);
        if !batch.is_empty() {
            return Ok(batch);
        }

        tokio::time::sleep(timeout).await;
        Ok(self.broker.fetch(&self.topics, &mut self.cursors))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            Counters::bump(&self.broker.counters.consumer_closes);
        }
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerHandle for MemoryProducer {
    async fn send(&self, record: OutgoingRecord) -> LifecycleResult<DeliveryReport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LifecycleError::Closed("producer handle".to_string()));
        }
        Counters::bump(&self.broker.counters.sends);

        let offset = self
            .broker
            .append(&record.topic, record.key, record.payload);
        Ok(DeliveryReport {
            topic: record.topic,
            partition: 0,
            offset,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            Counters::bump(&self.broker.counters.producer_closes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientProperties;

    fn consumer_settings(topics: &[&str]) -> ConsumerSettings {
        ConsumerSettings {
            id: "c".to_string(),
            bootstrap_servers: "memory".to_string(),
            group_id: "g".to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            properties: ClientProperties::new(),
        }
    }

    fn producer_settings() -> ProducerSettings {
        ProducerSettings {
            id: "p".to_string(),
            bootstrap_servers: "memory".to_string(),
            topic: "orders".to_string(),
            properties: ClientProperties::new(),
        }
    }

    #[tokio::test]
    async fn test_consumer_reads_from_cursor() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a", "1");

        let settings = consumer_settings(&["orders"]);
        let mut consumer = broker.connect_consumer(&settings).unwrap();
        consumer.subscribe(&settings.topics).await.unwrap();

        let first = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].offset, 0);

        broker.publish("orders", "b", "2");
        let second = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key(), Some(&b"b"[..]));

        assert!(consumer.poll(Duration::from_millis(1)).await.unwrap().is_empty());
        assert_eq!(broker.stats().polls, 3);
    }

    #[tokio::test]
    async fn test_poll_after_close_fails() {
        let broker = MemoryBroker::new();
        let settings = consumer_settings(&["orders"]);
        let mut consumer = broker.connect_consumer(&settings).unwrap();

        consumer.close().await;
        consumer.close().await;

        assert!(consumer.poll(Duration::from_millis(1)).await.is_err());
        assert_eq!(broker.stats().consumer_closes, 1);
    }

    #[tokio::test]
    async fn test_injected_poll_failure_is_one_shot() {
        let broker = MemoryBroker::new();
        broker.fail_next_poll("boom");

        let settings = consumer_settings(&["orders"]);
        let mut consumer = broker.connect_consumer(&settings).unwrap();
        consumer.subscribe(&settings.topics).await.unwrap();

        assert!(consumer.poll(Duration::from_millis(1)).await.is_err());
        assert!(consumer.poll(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_producer_appends_to_log() {
        let broker = MemoryBroker::new();
        let producer = broker.connect_producer(&producer_settings()).unwrap();

        let report = producer
            .send(OutgoingRecord {
                topic: "orders".to_string(),
                key: None,
                payload: Some(b"x".to_vec()),
            })
            .await
            .unwrap();
        assert_eq!(report.offset, 0);
        assert_eq!(broker.records("orders").len(), 1);

        producer.close().await;
        let refused = producer
            .send(OutgoingRecord {
                topic: "orders".to_string(),
                key: None,
                payload: Some(b"y".to_vec()),
            })
            .await;
        assert!(refused.is_err());

        let stats = broker.stats();
        assert_eq!(stats.producers_connected, 1);
        assert_eq!(stats.sends, 1);
        assert_eq!(stats.producer_closes, 1);
    }
}
