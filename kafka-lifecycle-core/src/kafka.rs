//! Kafka connector backed by librdkafka.
//!
//! Consumers are [`StreamConsumer`]s polled in small batches, producers are
//! [`FutureProducer`]s. Client properties come straight from the resolved settings, so any
//! librdkafka property can be passed through a client's extra properties.

use crate::{
    ClientConnector, ConsumedRecord, ConsumerHandle, ConsumerSettings, DeliveryReport,
    LifecycleError, LifecycleResult, OutgoingRecord, ProducerHandle, ProducerSettings,
};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Window for collecting more records once a batch has started
const BATCH_LINGER: Duration = Duration::from_millis(10);

/// [`ClientConnector`] creating rdkafka clients
#[derive(Debug, Clone)]
pub struct RdKafkaConnector {
    send_timeout: Duration,
    flush_timeout: Duration,
    max_batch: usize,
}

impl Default for RdKafkaConnector {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(10),
            max_batch: 500,
        }
    }
}

impl RdKafkaConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a send may wait in the local queue
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// How long closing a producer waits for outstanding messages
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Maximum number of records returned by one poll
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}

fn client_config(properties: BTreeMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key, value);
    }
    config
}

impl ClientConnector for RdKafkaConnector {
    fn connect_consumer(
        &self,
        settings: &ConsumerSettings,
    ) -> LifecycleResult<Box<dyn ConsumerHandle>> {
        let consumer: StreamConsumer = client_config(settings.client_properties())
            .create()
            .map_err(|e| {
                LifecycleError::client_with_source(
                    format!("Failed to create Kafka consumer {}", settings.id),
                    e,
                )
            })?;

        info!(
            "Created Kafka consumer {} (group {}) for {}",
            settings.id, settings.group_id, settings.bootstrap_servers
        );

        Ok(Box::new(KafkaConsumer {
            id: settings.id.clone(),
            consumer: Some(consumer),
            max_batch: self.max_batch,
        }))
    }

    fn connect_producer(
        &self,
        settings: &ProducerSettings,
    ) -> LifecycleResult<Arc<dyn ProducerHandle>> {
        let producer: FutureProducer = client_config(settings.client_properties())
            .create()
            .map_err(|e| {
                LifecycleError::client_with_source(
                    format!("Failed to create Kafka producer {}", settings.id),
                    e,
                )
            })?;

        info!(
            "Created Kafka producer {} for {}",
            settings.id, settings.bootstrap_servers
        );

        Ok(Arc::new(KafkaProducer {
            id: settings.id.clone(),
            producer,
            send_timeout: self.send_timeout,
            flush_timeout: self.flush_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

struct KafkaConsumer {
    id: String,
    consumer: Option<StreamConsumer>,
    max_batch: usize,
}

impl KafkaConsumer {
    fn consumer(&self) -> LifecycleResult<&StreamConsumer> {
        self.consumer
            .as_ref()
            .ok_or_else(|| LifecycleError::Closed(format!("Kafka consumer {}", self.id)))
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> ConsumedRecord {
    ConsumedRecord::new(
        message.topic(),
        message.key().map(<[u8]>::to_vec),
        message.payload().map(<[u8]>::to_vec),
    )
    .with_position(message.partition(), message.offset())
}

#[async_trait]
impl ConsumerHandle for KafkaConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> LifecycleResult<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?.subscribe(&topics).map_err(|e| {
            LifecycleError::delivery_with_source(format!("Failed to subscribe to {:?}", topics), e)
        })
    }

    async fn poll(&mut self, timeout: Duration) -> LifecycleResult<Vec<ConsumedRecord>> {
        let consumer = self.consumer()?;
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < self.max_batch {
            let wait_until = if batch.is_empty() {
                deadline
            } else {
                deadline.min(Instant::now() + BATCH_LINGER)
            };

            match tokio::time::timeout_at(wait_until, consumer.recv()).await {
                Ok(Ok(message)) => batch.push(to_record(&message)),
                Ok(Err(e)) if batch.is_empty() => {
                    return Err(LifecycleError::delivery_with_source(
                        "Error receiving message",
                        e,
                    ));
                }
                Ok(Err(e)) => {
                    warn!(
                        "Consumer {} receive error after {} records, returning partial batch: {}",
                        self.id,
                        batch.len(),
                        e
                    );
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    async fn close(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };

        consumer.unsubscribe();
        // dropping leaves the group and may block on the broker
        if let Err(e) = tokio::task::spawn_blocking(move || drop(consumer)).await {
            warn!("Consumer {} close task failed: {}", self.id, e);
        }
        debug!("Kafka consumer {} closed", self.id);
    }
}

struct KafkaProducer {
    id: String,
    producer: FutureProducer,
    send_timeout: Duration,
    flush_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerHandle for KafkaProducer {
    async fn send(&self, record: OutgoingRecord) -> LifecycleResult<DeliveryReport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LifecycleError::Closed(format!("Kafka producer {}", self.id)));
        }

        let mut future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&record.topic);
        if let Some(payload) = record.payload.as_deref() {
            future_record = future_record.payload(payload);
        }
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match self.producer.send(future_record, self.send_timeout).await {
            Ok((partition, offset)) => Ok(DeliveryReport {
                topic: record.topic.clone(),
                partition,
                offset,
            }),
            Err((e, _)) => Err(LifecycleError::delivery_with_source(
                format!("Failed to deliver message to {}", record.topic),
                e,
            )),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
            Ok(Ok(())) => debug!("Kafka producer {} flushed", self.id),
            Ok(Err(e)) => warn!("Kafka producer {} flush failed: {}", self.id, e),
            Err(e) => warn!("Kafka producer {} flush task failed: {}", self.id, e),
        }
    }
}
