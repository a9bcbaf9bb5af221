//! Builders that turn partially specified client settings into immutable client specs.
//!
//! A builder accumulates settings, falls back to the plugin-wide [`PluginDefaults`] for any
//! connection field it leaves unset, and validates completeness in `build()`. Validation is
//! fail-fast and always runs in the same order:
//!
//! - consumer: bootstrap servers, group id, topics, key codec, value codec, handler
//! - producer: bootstrap servers, topic, key codec, value codec
//!
//! Building never consumes the builder; calling `build()` again re-validates and yields a
//! spec with the same id.

use crate::traits::FnHandler;
use crate::{
    BoxError, ClientProperties, ConfigField, ConsumerSection, Deserializer, LifecycleError,
    LifecycleResult, PluginDefaults, ProducerSection, RecordHandler, Serializer,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Resolved connection settings for a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub id: String,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub properties: ClientProperties,
}

impl ConsumerSettings {
    /// Broker client properties; extra properties override the derived ones
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("bootstrap.servers".to_string(), self.bootstrap_servers.clone());
        props.insert("group.id".to_string(), self.group_id.clone());
        props.insert("auto.offset.reset".to_string(), "earliest".to_string());
        for (key, value) in self.properties.iter() {
            props.insert(key.to_string(), value.to_string());
        }
        props
    }
}

/// Resolved connection settings for a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub id: String,
    pub bootstrap_servers: String,
    pub topic: String,
    pub properties: ClientProperties,
}

impl ProducerSettings {
    /// Broker client properties; extra properties override the derived ones
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("bootstrap.servers".to_string(), self.bootstrap_servers.clone());
        for (key, value) in self.properties.iter() {
            props.insert(key.to_string(), value.to_string());
        }
        props
    }
}

/// Validated, immutable description of one consumer
pub struct ConsumerSpec<K, V> {
    settings: ConsumerSettings,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    handler: Arc<dyn RecordHandler<K, V>>,
}

impl<K, V> ConsumerSpec<K, V> {
    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn topics(&self) -> &[String] {
        &self.settings.topics
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub(crate) fn into_parts(self) -> ConsumerParts<K, V> {
        ConsumerParts {
            settings: self.settings,
            key_deserializer: self.key_deserializer,
            value_deserializer: self.value_deserializer,
            handler: self.handler,
        }
    }
}

impl<K, V> fmt::Debug for ConsumerSpec<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSpec")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ConsumerParts<K, V> {
    pub(crate) settings: ConsumerSettings,
    pub(crate) key_deserializer: Arc<dyn Deserializer<K>>,
    pub(crate) value_deserializer: Arc<dyn Deserializer<V>>,
    pub(crate) handler: Arc<dyn RecordHandler<K, V>>,
}

/// Validated, immutable description of one producer
pub struct ProducerSpec<K, V> {
    settings: ProducerSettings,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
}

impl<K, V> ProducerSpec<K, V> {
    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    pub(crate) fn into_parts(self) -> ProducerParts<K, V> {
        ProducerParts {
            settings: self.settings,
            key_serializer: self.key_serializer,
            value_serializer: self.value_serializer,
        }
    }
}

impl<K, V> fmt::Debug for ProducerSpec<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSpec")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ProducerParts<K, V> {
    pub(crate) settings: ProducerSettings,
    pub(crate) key_serializer: Arc<dyn Serializer<K>>,
    pub(crate) value_serializer: Arc<dyn Serializer<V>>,
}

/// A client declaration, either side
#[derive(Debug)]
pub enum ClientSpec<K, V> {
    Consumer(ConsumerSpec<K, V>),
    Producer(ProducerSpec<K, V>),
}

impl<K, V> ClientSpec<K, V> {
    pub fn id(&self) -> &str {
        match self {
            Self::Consumer(spec) => spec.id(),
            Self::Producer(spec) => spec.id(),
        }
    }
}

impl<K, V> From<ConsumerSpec<K, V>> for ClientSpec<K, V> {
    fn from(spec: ConsumerSpec<K, V>) -> Self {
        Self::Consumer(spec)
    }
}

impl<K, V> From<ProducerSpec<K, V>> for ClientSpec<K, V> {
    fn from(spec: ProducerSpec<K, V>) -> Self {
        Self::Producer(spec)
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

fn present(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.trim().is_empty()).cloned()
}

/// Mutable consumer settings, edited inside [`ConsumerBuilder::configure`]
pub struct ConsumerConfig<K, V> {
    pub id: String,
    pub bootstrap_servers: Option<String>,
    pub group_id: Option<String>,
    pub topics: Vec<String>,
    pub key_deserializer: Option<Arc<dyn Deserializer<K>>>,
    pub value_deserializer: Option<Arc<dyn Deserializer<V>>>,
    pub properties: ClientProperties,
}

impl<K, V> Default for ConsumerConfig<K, V> {
    fn default() -> Self {
        Self {
            id: fresh_id(),
            bootstrap_servers: None,
            group_id: None,
            topics: Vec::new(),
            key_deserializer: None,
            value_deserializer: None,
            properties: ClientProperties::new(),
        }
    }
}

impl<K, V> Clone for ConsumerConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            bootstrap_servers: self.bootstrap_servers.clone(),
            group_id: self.group_id.clone(),
            topics: self.topics.clone(),
            key_deserializer: self.key_deserializer.clone(),
            value_deserializer: self.value_deserializer.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// Builder for a [`ConsumerSpec`]
pub struct ConsumerBuilder<K, V> {
    defaults: PluginDefaults,
    config: ConsumerConfig<K, V>,
    handler: Option<Arc<dyn RecordHandler<K, V>>>,
}

impl<K: 'static, V: 'static> ConsumerBuilder<K, V> {
    /// Create a builder falling back to the given plugin defaults
    pub fn new(defaults: PluginDefaults) -> Self {
        Self {
            defaults,
            config: ConsumerConfig::default(),
            handler: None,
        }
    }

    /// Create a builder seeded from a configuration block
    pub fn from_section(defaults: PluginDefaults, section: &ConsumerSection) -> Self {
        let mut builder = Self::new(defaults);
        builder.config.id = section.id.clone();
        builder.config.topics = section.topics.clone();
        builder.config.bootstrap_servers = section.bootstrap_servers.clone();
        builder.config.group_id = section.group_id.clone();
        builder.config.properties = section.properties.clone();
        builder
    }

    /// Edit the settings in a block; the block works on a copy that replaces the current one
    pub fn configure(&mut self, block: impl FnOnce(&mut ConsumerConfig<K, V>)) -> &mut Self {
        let mut config = self.config.clone();
        block(&mut config);
        self.config = config;
        self
    }

    pub fn id(&mut self, id: impl Into<String>) -> &mut Self {
        self.config.id = id.into();
        self
    }

    pub fn bootstrap_servers(&mut self, servers: impl Into<String>) -> &mut Self {
        self.config.bootstrap_servers = Some(servers.into());
        self
    }

    pub fn group_id(&mut self, group_id: impl Into<String>) -> &mut Self {
        self.config.group_id = Some(group_id.into());
        self
    }

    /// Replace the topic list
    pub fn topics<I, S>(&mut self, topics: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn key_deserializer(&mut self, codec: impl Deserializer<K> + 'static) -> &mut Self {
        self.config.key_deserializer = Some(Arc::new(codec));
        self
    }

    pub fn value_deserializer(&mut self, codec: impl Deserializer<V> + 'static) -> &mut Self {
        self.config.value_deserializer = Some(Arc::new(codec));
        self
    }

    /// Set the record callback from a closure
    pub fn listener<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(K, V) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(FnHandler(listener)));
        self
    }

    /// Set the record callback
    pub fn handler(&mut self, handler: impl RecordHandler<K, V> + 'static) -> &mut Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set one extra broker property
    pub fn property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.properties.set(key, value);
        self
    }

    /// Merge extra broker properties, later entries win
    pub fn properties<I, PK, PV>(&mut self, props: I) -> &mut Self
    where
        I: IntoIterator<Item = (PK, PV)>,
        PK: Into<String>,
        PV: Into<String>,
    {
        self.config.properties.extend(props);
        self
    }

    /// Validate and produce the consumer spec
    pub fn build(&self) -> LifecycleResult<ConsumerSpec<K, V>> {
        let config = &self.config;

        let bootstrap_servers = present(&config.bootstrap_servers)
            .or_else(|| present(&self.defaults.bootstrap_servers))
            .ok_or(LifecycleError::missing(ConfigField::BootstrapServers))?;

        let group_id = present(&config.group_id)
            .or_else(|| present(&self.defaults.group_id))
            .ok_or(LifecycleError::missing(ConfigField::GroupId))?;

        if config.topics.is_empty() || config.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(LifecycleError::missing(ConfigField::Topics));
        }

        let key_deserializer = config
            .key_deserializer
            .clone()
            .ok_or(LifecycleError::missing(ConfigField::KeyCodec))?;

        let value_deserializer = config
            .value_deserializer
            .clone()
            .ok_or(LifecycleError::missing(ConfigField::ValueCodec))?;

        let handler = self
            .handler
            .clone()
            .ok_or(LifecycleError::missing(ConfigField::Handler))?;

        Ok(ConsumerSpec {
            settings: ConsumerSettings {
                id: config.id.clone(),
                bootstrap_servers,
                group_id,
                topics: config.topics.clone(),
                properties: config.properties.clone(),
            },
            key_deserializer,
            value_deserializer,
            handler,
        })
    }
}

/// Mutable producer settings, edited inside [`ProducerBuilder::configure`]
pub struct ProducerConfig<K, V> {
    pub id: String,
    pub bootstrap_servers: Option<String>,
    pub topic: Option<String>,
    pub key_serializer: Option<Arc<dyn Serializer<K>>>,
    pub value_serializer: Option<Arc<dyn Serializer<V>>>,
    pub properties: ClientProperties,
}

impl<K, V> Default for ProducerConfig<K, V> {
    fn default() -> Self {
        Self {
            id: fresh_id(),
            bootstrap_servers: None,
            topic: None,
            key_serializer: None,
            value_serializer: None,
            properties: ClientProperties::new(),
        }
    }
}

impl<K, V> Clone for ProducerConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            bootstrap_servers: self.bootstrap_servers.clone(),
            topic: self.topic.clone(),
            key_serializer: self.key_serializer.clone(),
            value_serializer: self.value_serializer.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// Builder for a [`ProducerSpec`]
pub struct ProducerBuilder<K, V> {
    defaults: PluginDefaults,
    config: ProducerConfig<K, V>,
}

impl<K: 'static, V: 'static> ProducerBuilder<K, V> {
    /// Create a builder falling back to the given plugin defaults
    pub fn new(defaults: PluginDefaults) -> Self {
        Self {
            defaults,
            config: ProducerConfig::default(),
        }
    }

    /// Create a builder seeded from a configuration block
    pub fn from_section(defaults: PluginDefaults, section: &ProducerSection) -> Self {
        let mut builder = Self::new(defaults);
        builder.config.id = section.id.clone();
        builder.config.topic = section.topic.clone();
        builder.config.bootstrap_servers = section.bootstrap_servers.clone();
        builder.config.properties = section.properties.clone();
        builder
    }

    /// Edit the settings in a block; the block works on a copy that replaces the current one
    pub fn configure(&mut self, block: impl FnOnce(&mut ProducerConfig<K, V>)) -> &mut Self {
        let mut config = self.config.clone();
        block(&mut config);
        self.config = config;
        self
    }

    pub fn id(&mut self, id: impl Into<String>) -> &mut Self {
        self.config.id = id.into();
        self
    }

    pub fn bootstrap_servers(&mut self, servers: impl Into<String>) -> &mut Self {
        self.config.bootstrap_servers = Some(servers.into());
        self
    }

    pub fn topic(&mut self, topic: impl Into<String>) -> &mut Self {
        self.config.topic = Some(topic.into());
        self
    }

    pub fn key_serializer(&mut self, codec: impl Serializer<K> + 'static) -> &mut Self {
        self.config.key_serializer = Some(Arc::new(codec));
        self
    }

    pub fn value_serializer(&mut self, codec: impl Serializer<V> + 'static) -> &mut Self {
        self.config.value_serializer = Some(Arc::new(codec));
        self
    }

    pub fn property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.properties.set(key, value);
        self
    }

    pub fn properties<I, PK, PV>(&mut self, props: I) -> &mut Self
    where
        I: IntoIterator<Item = (PK, PV)>,
        PK: Into<String>,
        PV: Into<String>,
    {
        self.config.properties.extend(props);
        self
    }

    /// Validate and produce the producer spec
    pub fn build(&self) -> LifecycleResult<ProducerSpec<K, V>> {
        let config = &self.config;

        let bootstrap_servers = present(&config.bootstrap_servers)
            .or_else(|| present(&self.defaults.bootstrap_servers))
            .ok_or(LifecycleError::missing(ConfigField::BootstrapServers))?;

        let topic = present(&config.topic).ok_or(LifecycleError::missing(ConfigField::Topic))?;

        let key_serializer = config
            .key_serializer
            .clone()
            .ok_or(LifecycleError::missing(ConfigField::KeyCodec))?;

        let value_serializer = config
            .value_serializer
            .clone()
            .ok_or(LifecycleError::missing(ConfigField::ValueCodec))?;

        Ok(ProducerSpec {
            settings: ProducerSettings {
                id: config.id.clone(),
                bootstrap_servers,
                topic,
                properties: config.properties.clone(),
            },
            key_serializer,
            value_serializer,
        })
    }
}
