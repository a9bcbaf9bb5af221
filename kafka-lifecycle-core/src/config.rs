//! Plugin-wide configuration and per-client configuration blocks.

use crate::{LifecycleError, LifecycleResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Extra broker client properties
///
/// Keys are unique; a later `set` or `extend` overwrites an earlier value for the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientProperties(BTreeMap<String, String>);

impl ClientProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Merge properties, later entries win
    pub fn extend<I, K, V>(&mut self, props: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in props {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ClientProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Self::new();
        props.extend(iter);
        props
    }
}

/// Plugin-wide fallbacks applied to fields a client builder leaves unset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginDefaults {
    pub bootstrap_servers: Option<String>,
    pub group_id: Option<String>,
}

/// Per-consumer configuration block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerSection {
    /// Client id (must be unique across the plugin)
    pub id: String,

    /// Topics to subscribe to
    #[serde(default)]
    pub topics: Vec<String>,

    /// Overrides the plugin-wide bootstrap servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_servers: Option<String>,

    /// Overrides the plugin-wide group id
    #[serde(default, alias = "groupId", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Extra broker client properties
    #[serde(default)]
    pub properties: ClientProperties,
}

/// Per-producer configuration block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerSection {
    /// Client id (must be unique across the plugin)
    pub id: String,

    /// Destination topic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Overrides the plugin-wide bootstrap servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_servers: Option<String>,

    /// Extra broker client properties
    #[serde(default)]
    pub properties: ClientProperties,
}

/// Plugin-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Shared bootstrap servers used when a client does not set its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_servers: Option<String>,

    /// Shared consumer group id used when a consumer does not set its own
    #[serde(default, alias = "groupId", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Consumer poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// How long stop waits for each consumer task before aborting it
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Consumer blocks
    #[serde(default)]
    pub consumers: Vec<ConsumerSection>,

    /// Producer blocks
    #[serde(default)]
    pub producers: Vec<ProducerSection>,
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PluginConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> LifecycleResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LifecycleError::settings(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            LifecycleError::settings(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> LifecycleResult<Self> {
        toml::from_str(content)
            .map_err(|e| LifecycleError::settings(format!("Failed to parse config: {}", e)))
    }

    /// Build configuration from raw key/value pairs supplied by a host config loader
    ///
    /// Recognised keys: `bootstrap_servers`, `groupId` (or `group_id`), `poll_timeout_ms`,
    /// `shutdown_grace_ms` and `log_level`. Other keys are ignored.
    pub fn from_properties<I, K, V>(pairs: I) -> LifecycleResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();

        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.into();
            match key {
                "bootstrap_servers" => config.bootstrap_servers = Some(value),
                "groupId" | "group_id" => config.group_id = Some(value),
                "poll_timeout_ms" => config.poll_timeout_ms = parse_millis(key, &value)?,
                "shutdown_grace_ms" => config.shutdown_grace_ms = parse_millis(key, &value)?,
                "log_level" => config.log_level = value,
                _ => debug!("Ignoring unknown kafka setting: {}", key),
            }
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> LifecycleResult<()> {
        if self.poll_timeout_ms == 0 {
            return Err(LifecycleError::settings("poll_timeout_ms must be > 0"));
        }

        if self.shutdown_grace_ms == 0 {
            return Err(LifecycleError::settings("shutdown_grace_ms must be > 0"));
        }

        let mut seen = HashSet::new();
        let ids = self
            .consumers
            .iter()
            .map(|c| c.id.as_str())
            .chain(self.producers.iter().map(|p| p.id.as_str()));
        for id in ids {
            if id.trim().is_empty() {
                return Err(LifecycleError::settings("client section id cannot be empty"));
            }
            if !seen.insert(id) {
                return Err(LifecycleError::settings(format!(
                    "duplicate client section id: {}",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Fallbacks handed to every client builder
    pub fn defaults(&self) -> PluginDefaults {
        PluginDefaults {
            bootstrap_servers: self.bootstrap_servers.clone(),
            group_id: self.group_id.clone(),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Find a consumer block by id
    pub fn consumer_section(&self, id: &str) -> Option<&ConsumerSection> {
        self.consumers.iter().find(|c| c.id == id)
    }

    /// Find a producer block by id
    pub fn producer_section(&self, id: &str) -> Option<&ProducerSection> {
        self.producers.iter().find(|p| p.id == id)
    }
}

fn parse_millis(key: &str, value: &str) -> LifecycleResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| LifecycleError::settings(format!("{} must be a number, got '{}'", key, value)))
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: None,
            group_id: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            log_level: default_log_level(),
            consumers: Vec::new(),
            producers: Vec::new(),
        }
    }
}
