//! Producer runner: fire-and-forget sends to one destination topic.
//!
//! Sends never block and never fail towards the caller. Each accepted send runs as a tracked
//! task; its outcome goes to a completion callback, which by default only logs it. Once the
//! runner is closed further sends are dropped with a warning.

use crate::builder::ProducerParts;
use crate::metrics::ClientMetrics;
use crate::runtime::ManagedProducer;
use crate::{
    DeliveryReport, LifecycleError, LifecycleResult, OutgoingRecord, ProducerHandle,
    ProducerRecord, ProducerSpec, Serializer,
};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Owns one producer handle; cheap to clone
pub struct ProducerRunner<K, V> {
    inner: Arc<ProducerInner<K, V>>,
}

struct ProducerInner<K, V> {
    id: String,
    topic: String,
    handle: Arc<dyn ProducerHandle>,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    /// Only set by close, only read by send
    closed: AtomicBool,
    pending: CancellationToken,
    tracker: TaskTracker,
    metrics: ClientMetrics,
}

impl<K, V> Clone for ProducerRunner<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for ProducerRunner<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerRunner")
            .field("id", &self.inner.id)
            .field("topic", &self.inner.topic)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<K, V> ProducerInner<K, V> {
    fn encode(&self, record: ProducerRecord<K, V>) -> LifecycleResult<OutgoingRecord> {
        let key = record
            .key
            .as_ref()
            .map(|key| self.key_serializer.serialize(&record.topic, key))
            .transpose()?
            .flatten();
        let payload = self.value_serializer.serialize(&record.topic, &record.value)?;

        Ok(OutgoingRecord {
            topic: record.topic,
            key,
            payload,
        })
    }
}

impl<K: 'static, V: 'static> ProducerRunner<K, V> {
    /// Wrap a connected handle
    pub fn new(spec: ProducerSpec<K, V>, handle: Arc<dyn ProducerHandle>) -> Self {
        let ProducerParts {
            settings,
            key_serializer,
            value_serializer,
        } = spec.into_parts();

        Self {
            inner: Arc::new(ProducerInner {
                metrics: ClientMetrics::new(&settings.id),
                id: settings.id,
                topic: settings.topic,
                handle,
                key_serializer,
                value_serializer,
                closed: AtomicBool::new(false),
                pending: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Destination topic
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Send a value without a key to the destination topic
    pub fn send(&self, value: V) {
        self.send_record(ProducerRecord::new(self.inner.topic.clone(), value));
    }

    /// Send a keyed value to the destination topic
    pub fn send_with_key(&self, key: K, value: V) {
        self.send_record(ProducerRecord::new(self.inner.topic.clone(), value).with_key(key));
    }

    /// Send a record; the outcome is logged
    pub fn send_record(&self, record: ProducerRecord<K, V>) {
        let id = self.inner.id.clone();
        self.send_with_callback(record, move |result| match result {
            Ok(report) => debug!("Producer {} delivered message to {}", id, report),
            Err(e) => error!("Producer {} failed to deliver message: {}", id, e),
        });
    }

    /// Send a record and hand the outcome to `on_complete`
    ///
    /// The callback runs once the broker acknowledged or rejected the record, or right away
    /// when the record cannot be encoded. It is not called for records dropped after close.
    pub fn send_with_callback<F>(&self, record: ProducerRecord<K, V>, on_complete: F)
    where
        F: FnOnce(LifecycleResult<DeliveryReport>) + Send + 'static,
    {
        let inner = &self.inner;

        if inner.closed.load(Ordering::Acquire) {
            warn!(
                "Producer {} is closed, dropping message for {}",
                inner.id, record.topic
            );
            inner.metrics.record_dropped();
            return;
        }

        let outgoing = match inner.encode(record) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                error!("Producer {} could not encode message: {}", inner.id, e);
                inner.metrics.record_error("encode");
                on_complete(Err(e));
                return;
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Producer {} cannot send outside a tokio runtime: {}", inner.id, e);
                on_complete(Err(LifecycleError::delivery_with_source(
                    "No tokio runtime to run the send on",
                    e,
                )));
                return;
            }
        };

        let handle = Arc::clone(&inner.handle);
        let pending = inner.pending.clone();
        let metrics = inner.metrics.clone();
        let topic = outgoing.topic.clone();
        let size = outgoing.size();

        inner.tracker.spawn_on(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = pending.cancelled() => Err(LifecycleError::Closed(format!(
                        "Send to {} abandoned because the producer closed",
                        topic
                    ))),
                    result = handle.send(outgoing) => result,
                };

                match &result {
                    Ok(_) => metrics.record_sent(size),
                    Err(_) => metrics.record_error("send"),
                }
                on_complete(result);
            },
            &runtime,
        );
    }

    /// Number of sends still waiting for an acknowledgement
    pub fn pending(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Close the handle and cancel pending sends; later calls return immediately
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Producer {} is already closed", inner.id);
            return;
        }

        info!("Closing producer {}", inner.id);
        inner.handle.close().await;
        inner.pending.cancel();
        inner.tracker.close();
        inner.tracker.wait().await;
        info!("Producer {} closed", inner.id);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<K: 'static, V: 'static> ManagedProducer for ProducerRunner<K, V> {
    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn close(&self) {
        ProducerRunner::close(self).await
    }

    fn is_closed(&self) -> bool {
        ProducerRunner::is_closed(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
