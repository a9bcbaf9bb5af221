//! # Kafka Lifecycle Core
//!
//! Declare named Kafka consumers and producers and run them as one managed unit.
//!
//! This library sits between a host application and a Kafka client library. The host
//! declares its clients through validated builders; the library owns every client handle,
//! runs one poll loop per consumer, guards producers against use after close, and starts or
//! stops the whole set when the host starts or stops.
//!
//! ## Overview
//!
//! - **Builders** merge per-client settings with plugin-wide defaults and validate them
//! - **Registry** maps client ids to runners; the first declaration of an id wins
//! - **ConsumerRunner** polls its handle on its own task and feeds records to a [`RecordHandler`]
//! - **ProducerRunner** sends fire-and-forget to one destination topic
//! - **LifecycleManager** starts all consumers, then stops consumers before closing producers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kafka_lifecycle_core::{
//!     ConsumerBuilder, KafkaPlugin, MemoryBroker, PluginConfig, ProducerBuilder, StringCodec,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> kafka_lifecycle_core::LifecycleResult<()> {
//!     let config = PluginConfig {
//!         bootstrap_servers: Some("localhost:9092".to_string()),
//!         group_id: Some("billing".to_string()),
//!         ..Default::default()
//!     };
//!     let plugin = KafkaPlugin::new(config, Arc::new(MemoryBroker::new()))?;
//!
//!     let audit = plugin.producer(|b: &mut ProducerBuilder<String, String>| {
//!         b.topic("orders-audit")
//!             .key_serializer(StringCodec)
//!             .value_serializer(StringCodec);
//!     })?;
//!
//!     plugin.consumer(move |b: &mut ConsumerBuilder<String, String>| {
//!         b.topics(["orders"])
//!             .key_deserializer(StringCodec)
//!             .value_deserializer(StringCodec)
//!             .listener(move |key, value| {
//!                 audit.send_with_key(key, value);
//!                 Ok(())
//!             });
//!     })?;
//!
//!     plugin.on_application_started();
//!     tokio::signal::ctrl_c().await.ok();
//!     plugin.on_application_stopping().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Exactly-once registration**: duplicate ids are logged and dropped, never connected
//! - **Idempotent lifecycle**: repeated start, stop and close calls are harmless no-ops
//! - **Contained failures**: a failing handler ends its own consumer only
//! - **Pluggable brokers**: an in-process [`MemoryBroker`], or librdkafka with the `kafka` feature

mod builder;
mod codec;
mod config;
mod error;
#[cfg(feature = "kafka")]
mod kafka;
mod lifecycle;
mod memory;
mod message;
mod metrics;
mod plugin;
mod registry;
mod runtime;
mod traits;

// Re-export public API
pub use builder::{
    ClientSpec, ConsumerBuilder, ConsumerConfig, ConsumerSettings, ConsumerSpec, ProducerBuilder,
    ProducerConfig, ProducerSettings, ProducerSpec,
};
pub use codec::{BytesCodec, Deserializer, JsonCodec, Nullable, Serializer, StringCodec};
pub use config::{ClientProperties, ConsumerSection, PluginConfig, PluginDefaults, ProducerSection};
pub use error::{BoxError, ConfigField, LifecycleError, LifecycleResult};
#[cfg(feature = "kafka")]
pub use kafka::RdKafkaConnector;
pub use lifecycle::LifecycleManager;
pub use memory::{BrokerStats, MemoryBroker};
pub use message::{ConsumedRecord, DeliveryReport, OutgoingRecord, ProducerRecord};
pub use crate::metrics::ClientMetrics;
pub use plugin::{init_tracing, KafkaPlugin};
pub use registry::Registry;
pub use runtime::{
    ConsumerRunner, ManagedConsumer, ManagedProducer, ProducerRunner, Runner, RunnerOptions,
};
pub use traits::{ClientConnector, ConsumerHandle, ProducerHandle, RecordHandler};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
pub(crate) mod test_util {
    use std::time::Duration;

    /// Poll `check` until it holds, failing the test after two seconds
    pub(crate) async fn wait_until<F: FnMut() -> bool>(mut check: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within 2s"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
