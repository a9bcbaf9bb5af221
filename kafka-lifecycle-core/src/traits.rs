//! Capability traits at the seams of the crate.
//!
//! - [`ConsumerHandle`] / [`ProducerHandle`]: the minimal surface of a broker client
//! - [`ClientConnector`]: creates handles from resolved client settings
//! - [`RecordHandler`]: user callback invoked for every consumed record

use crate::{
    BoxError, ConsumedRecord, ConsumerSettings, DeliveryReport, LifecycleResult, OutgoingRecord,
    ProducerSettings,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Consumer side of a broker client
///
/// A handle is owned by exactly one runner and only touched from that runner's task.
#[async_trait]
pub trait ConsumerHandle: Send {
    /// Subscribe to the given topics
    async fn subscribe(&mut self, topics: &[String]) -> LifecycleResult<()>;

    /// Fetch the next batch of records, waiting at most `timeout`
    ///
    /// An empty batch is a normal outcome when nothing arrived in time.
    async fn poll(&mut self, timeout: Duration) -> LifecycleResult<Vec<ConsumedRecord>>;

    /// Release the underlying connection
    async fn close(&mut self);
}

/// Producer side of a broker client
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    /// Send a record and wait for the broker acknowledgement
    async fn send(&self, record: OutgoingRecord) -> LifecycleResult<DeliveryReport>;

    /// Flush and release the underlying connection
    async fn close(&self);
}

/// Factory for broker handles
pub trait ClientConnector: Send + Sync {
    /// Create a consumer handle for the given settings
    fn connect_consumer(&self, settings: &ConsumerSettings)
        -> LifecycleResult<Box<dyn ConsumerHandle>>;

    /// Create a producer handle for the given settings
    fn connect_producer(&self, settings: &ProducerSettings)
        -> LifecycleResult<Arc<dyn ProducerHandle>>;
}

/// Callback invoked for each consumed record, in the order the handle returned them
///
/// Returning an error ends the consumer's poll loop.
pub trait RecordHandler<K, V>: Send + Sync {
    fn handle(&self, key: K, value: V) -> Result<(), BoxError>;
}

/// Adapter turning a closure into a [`RecordHandler`]
pub(crate) struct FnHandler<F>(pub(crate) F);

impl<K, V, F> RecordHandler<K, V> for FnHandler<F>
where
    F: Fn(K, V) -> Result<(), BoxError> + Send + Sync,
{
    fn handle(&self, key: K, value: V) -> Result<(), BoxError> {
        (self.0)(key, value)
    }
}
