//! Glue between a host application and the lifecycle manager.
//!
//! The host builds a [`KafkaPlugin`] from its configuration, declares clients while wiring the
//! application, then forwards its two lifecycle events:
//!
//! ```rust,no_run
//! use kafka_lifecycle_core::{ConsumerBuilder, KafkaPlugin, MemoryBroker, PluginConfig, StringCodec};
//! use std::sync::Arc;
//!
//! # async fn run() -> kafka_lifecycle_core::LifecycleResult<()> {
//! let config = PluginConfig::from_file("kafka.toml")?;
//! let plugin = KafkaPlugin::new(config, Arc::new(MemoryBroker::new()))?;
//!
//! plugin.consumer(|b: &mut ConsumerBuilder<String, String>| {
//!     b.topics(["orders"])
//!         .key_deserializer(StringCodec)
//!         .value_deserializer(StringCodec)
//!         .listener(|key: String, value: String| {
//!             println!("{key} => {value}");
//!             Ok(())
//!         });
//! })?;
//!
//! plugin.on_application_started();
//! // ... application runs ...
//! plugin.on_application_stopping().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    ClientConnector, ClientSpec, ConsumerBuilder, LifecycleError, LifecycleManager,
    LifecycleResult, PluginConfig, ProducerBuilder, ProducerRunner,
};
use std::sync::Arc;
use tracing::info;

/// Entry point for declaring clients and driving their lifecycle
pub struct KafkaPlugin {
    config: PluginConfig,
    manager: Arc<LifecycleManager>,
}

impl KafkaPlugin {
    /// Validate the configuration and create the lifecycle manager
    pub fn new(config: PluginConfig, connector: Arc<dyn ClientConnector>) -> LifecycleResult<Self> {
        config.validate()?;

        info!(
            "Kafka plugin configured: {} consumer sections, {} producer sections",
            config.consumers.len(),
            config.producers.len()
        );

        let manager = Arc::new(LifecycleManager::new(connector, &config));
        Ok(Self { config, manager })
    }

    /// Create the plugin on top of librdkafka
    #[cfg(feature = "kafka")]
    pub fn with_kafka(config: PluginConfig) -> LifecycleResult<Self> {
        Self::new(config, Arc::new(crate::RdKafkaConnector::new()))
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Declare a consumer; returns `false` when its id was already registered
    pub fn consumer<K, V, F>(&self, block: F) -> LifecycleResult<bool>
    where
        K: 'static,
        V: 'static,
        F: FnOnce(&mut ConsumerBuilder<K, V>),
    {
        let mut builder = ConsumerBuilder::new(self.config.defaults());
        block(&mut builder);
        self.manager.register(ClientSpec::Consumer(builder.build()?))
    }

    /// Declare a consumer seeded from the configuration block with the given id
    ///
    /// The block still has to provide codecs and a handler.
    pub fn consumer_from_section<K, V, F>(&self, id: &str, block: F) -> LifecycleResult<bool>
    where
        K: 'static,
        V: 'static,
        F: FnOnce(&mut ConsumerBuilder<K, V>),
    {
        let section = self.config.consumer_section(id).ok_or_else(|| {
            LifecycleError::settings(format!("No consumer section with id {}", id))
        })?;

        let mut builder = ConsumerBuilder::from_section(self.config.defaults(), section);
        block(&mut builder);
        self.manager.register(ClientSpec::Consumer(builder.build()?))
    }

    /// Declare a producer and return a handle for sending
    ///
    /// Declaring an id twice returns the producer registered first, provided its key and
    /// value types match.
    pub fn producer<K, V, F>(&self, block: F) -> LifecycleResult<ProducerRunner<K, V>>
    where
        K: 'static,
        V: 'static,
        F: FnOnce(&mut ProducerBuilder<K, V>),
    {
        let mut builder = ProducerBuilder::new(self.config.defaults());
        block(&mut builder);
        self.register_producer(&builder)
    }

    /// Declare a producer seeded from the configuration block with the given id
    pub fn producer_from_section<K, V, F>(
        &self,
        id: &str,
        block: F,
    ) -> LifecycleResult<ProducerRunner<K, V>>
    where
        K: 'static,
        V: 'static,
        F: FnOnce(&mut ProducerBuilder<K, V>),
    {
        let section = self.config.producer_section(id).ok_or_else(|| {
            LifecycleError::settings(format!("No producer section with id {}", id))
        })?;

        let mut builder = ProducerBuilder::from_section(self.config.defaults(), section);
        block(&mut builder);
        self.register_producer(&builder)
    }

    fn register_producer<K: 'static, V: 'static>(
        &self,
        builder: &ProducerBuilder<K, V>,
    ) -> LifecycleResult<ProducerRunner<K, V>> {
        let spec = builder.build()?;
        let id = spec.id().to_string();
        self.manager.register(ClientSpec::Producer(spec))?;

        self.manager.producer::<K, V>(&id).ok_or_else(|| {
            LifecycleError::settings(format!(
                "Client {} is already registered with a different kind or type",
                id
            ))
        })
    }

    /// Host hook: the application has started
    pub fn on_application_started(&self) -> usize {
        self.manager.start_all()
    }

    /// Host hook: the application is stopping; returns once every client is stopped
    pub async fn on_application_stopping(&self) -> bool {
        self.manager.stop_all().await
    }
}

/// Install a global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level`. Does nothing if a subscriber is already set.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::wait_until;
    use crate::{ConfigField, ConsumerSection, MemoryBroker, ProducerSection, StringCodec};
    use std::sync::Mutex;

    fn config() -> PluginConfig {
        PluginConfig {
            bootstrap_servers: Some("memory".to_string()),
            group_id: Some("billing".to_string()),
            poll_timeout_ms: 10,
            consumers: vec![ConsumerSection {
                id: "orders".to_string(),
                topics: vec!["orders".to_string()],
                ..Default::default()
            }],
            producers: vec![ProducerSection {
                id: "audit".to_string(),
                topic: Some("orders-audit".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PluginConfig {
            poll_timeout_ms: 0,
            ..Default::default()
        };
        assert!(KafkaPlugin::new(config, Arc::new(MemoryBroker::new())).is_err());
    }

    #[test]
    fn test_configuration_error_surfaces_at_declaration() {
        let plugin = KafkaPlugin::new(PluginConfig::default(), Arc::new(MemoryBroker::new())).unwrap();

        let err = plugin
            .consumer(|b: &mut ConsumerBuilder<String, String>| {
                b.topics(["orders"]);
            })
            .unwrap_err();
        assert_eq!(err.missing_field(), Some(ConfigField::BootstrapServers));
        assert!(plugin.manager().registry().is_empty());
    }

    #[test]
    fn test_unknown_section() {
        let plugin = KafkaPlugin::new(config(), Arc::new(MemoryBroker::new())).unwrap();
        let err = plugin
            .consumer_from_section("payments", |_b: &mut ConsumerBuilder<String, String>| {})
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidSettings(_)));
    }

    #[test]
    fn test_producer_redeclared_with_other_types() {
        let plugin = KafkaPlugin::new(config(), Arc::new(MemoryBroker::new())).unwrap();

        let first = plugin
            .producer_from_section("audit", |b: &mut ProducerBuilder<String, String>| {
                b.key_serializer(StringCodec).value_serializer(StringCodec);
            })
            .unwrap();
        assert_eq!(first.topic(), "orders-audit");

        let again = plugin
            .producer_from_section("audit", |b: &mut ProducerBuilder<String, String>| {
                b.key_serializer(StringCodec).value_serializer(StringCodec);
            })
            .unwrap();
        assert_eq!(again.id(), first.id());

        let err = plugin
            .producer_from_section("audit", |b: &mut ProducerBuilder<Vec<u8>, Vec<u8>>| {
                b.key_serializer(crate::BytesCodec)
                    .value_serializer(crate::BytesCodec);
            })
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidSettings(_)));
    }

    #[tokio::test]
    async fn test_hooks_drive_lifecycle() {
        let broker = MemoryBroker::new();
        let plugin = KafkaPlugin::new(config(), Arc::new(broker.clone())).unwrap();

        let audit = plugin
            .producer_from_section("audit", |b: &mut ProducerBuilder<String, String>| {
                b.key_serializer(StringCodec).value_serializer(StringCodec);
            })
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let forward = audit.clone();
        let registered = plugin
            .consumer_from_section("orders", move |b: &mut ConsumerBuilder<String, String>| {
                b.key_deserializer(StringCodec)
                    .value_deserializer(StringCodec)
                    .listener(move |key, value| {
                        sink.lock().unwrap().push(value.clone());
                        forward.send_with_key(key, value);
                        Ok(())
                    });
            })
            .unwrap();
        assert!(registered);

        assert_eq!(plugin.on_application_started(), 1);
        broker.publish("orders", "o-1", "placed");
        wait_until(|| broker.records("orders-audit").len() == 1).await;

        assert!(plugin.on_application_stopping().await);
        assert!(!plugin.on_application_stopping().await);

        assert_eq!(*seen.lock().unwrap(), vec!["placed".to_string()]);
        assert!(audit.is_closed());
        let stats = broker.stats();
        assert_eq!(stats.consumer_closes, 1);
        assert_eq!(stats.producer_closes, 1);
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("debug");
        init_tracing("info");
    }
}
