//! Id to runner mapping.
//!
//! Registration is insert-if-absent: the first declaration of an id wins, later ones are
//! logged and dropped. The broker handle is only created once the id is known to be free, so a
//! duplicate declaration never opens a connection. Entries are never removed.

use crate::runtime::{ManagedConsumer, ManagedProducer, Runner, RunnerOptions};
use crate::{
    ClientConnector, ClientSpec, ConsumerRunner, ConsumerSpec, LifecycleResult, ProducerRunner,
    ProducerSpec,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Concurrency-safe registry of named clients
pub struct Registry {
    entries: DashMap<String, Runner>,
    connector: Arc<dyn ClientConnector>,
    options: RunnerOptions,
}

impl Registry {
    pub fn new(connector: Arc<dyn ClientConnector>, options: RunnerOptions) -> Self {
        Self {
            entries: DashMap::new(),
            connector,
            options,
        }
    }

    /// Register a client
    ///
    /// Returns `Ok(false)` when the id is already taken. An error means the connector could
    /// not create the handle; nothing is registered in that case.
    ///
    /// The connector runs while the id's slot is locked, so it must not call back into the
    /// registry.
    pub fn register<K: 'static, V: 'static>(&self, spec: ClientSpec<K, V>) -> LifecycleResult<bool> {
        match self.entries.entry(spec.id().to_string()) {
            Entry::Occupied(existing) => {
                warn!(
                    "Client {} is already registered as a {}, ignoring duplicate declaration",
                    existing.key(),
                    existing.get().kind()
                );
                Ok(false)
            }
            Entry::Vacant(slot) => {
                let runner = match spec {
                    ClientSpec::Consumer(spec) => self.consumer_runner(spec)?,
                    ClientSpec::Producer(spec) => self.producer_runner(spec)?,
                };
                info!("Registered {} {}", runner.kind(), slot.key());
                slot.insert(runner);
                Ok(true)
            }
        }
    }

    pub fn register_consumer<K: 'static, V: 'static>(
        &self,
        spec: ConsumerSpec<K, V>,
    ) -> LifecycleResult<bool> {
        self.register(ClientSpec::Consumer(spec))
    }

    pub fn register_producer<K: 'static, V: 'static>(
        &self,
        spec: ProducerSpec<K, V>,
    ) -> LifecycleResult<bool> {
        self.register(ClientSpec::Producer(spec))
    }

    fn consumer_runner<K: 'static, V: 'static>(
        &self,
        spec: ConsumerSpec<K, V>,
    ) -> LifecycleResult<Runner> {
        let handle = self.connector.connect_consumer(spec.settings())?;
        Ok(Runner::Consumer(Arc::new(ConsumerRunner::new(
            spec,
            handle,
            self.options,
        ))))
    }

    fn producer_runner<K: 'static, V: 'static>(
        &self,
        spec: ProducerSpec<K, V>,
    ) -> LifecycleResult<Runner> {
        let handle = self.connector.connect_producer(spec.settings())?;
        Ok(Runner::Producer(Arc::new(ProducerRunner::new(spec, handle))))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Clone of the runner registered under `id`
    pub fn get(&self, id: &str) -> Option<Runner> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn consumers(&self) -> Vec<Arc<dyn ManagedConsumer>> {
        self.entries
            .iter()
            .filter_map(|e| e.value().as_consumer().cloned())
            .collect()
    }

    pub fn producers(&self) -> Vec<Arc<dyn ManagedProducer>> {
        self.entries
            .iter()
            .filter_map(|e| e.value().as_producer().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ConsumerBuilder, ConsumerSettings, ConsumerHandle, LifecycleError, MemoryBroker,
        PluginDefaults, ProducerBuilder, ProducerHandle, ProducerSettings, StringCodec,
    };
    use std::time::Duration;

    fn consumer_spec(id: &str) -> ConsumerSpec<String, String> {
        let mut builder = ConsumerBuilder::new(PluginDefaults::default());
        builder
            .id(id)
            .bootstrap_servers("memory")
            .group_id("g")
            .topics(["orders"])
            .key_deserializer(StringCodec)
            .value_deserializer(StringCodec)
            .listener(|_, _| Ok(()));
        builder.build().unwrap()
    }

    fn producer_spec(id: &str) -> ProducerSpec<String, String> {
        let mut builder = ProducerBuilder::new(PluginDefaults::default());
        builder
            .id(id)
            .bootstrap_servers("memory")
            .topic("audit")
            .key_serializer(StringCodec)
            .value_serializer(StringCodec);
        builder.build().unwrap()
    }

    fn registry(broker: &MemoryBroker) -> Registry {
        Registry::new(
            Arc::new(broker.clone()),
            RunnerOptions {
                poll_timeout: Duration::from_millis(10),
            },
        )
    }

    struct Refusing;

    impl ClientConnector for Refusing {
        fn connect_consumer(
            &self,
            settings: &ConsumerSettings,
        ) -> LifecycleResult<Box<dyn ConsumerHandle>> {
            Err(LifecycleError::client(format!("cannot reach {}", settings.bootstrap_servers)))
        }

        fn connect_producer(
            &self,
            settings: &ProducerSettings,
        ) -> LifecycleResult<Arc<dyn ProducerHandle>> {
            Err(LifecycleError::client(format!("cannot reach {}", settings.bootstrap_servers)))
        }
    }

    #[test]
    fn test_duplicate_id_keeps_first_entry() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker);

        assert!(registry.register_consumer(consumer_spec("orders")).unwrap());
        assert!(!registry.register_consumer(consumer_spec("orders")).unwrap());
        assert!(!registry.register_producer(producer_spec("orders")).unwrap());

        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.get("orders"), Some(Runner::Consumer(_))));
        assert_eq!(broker.stats().consumers_connected, 1);
        assert_eq!(broker.stats().producers_connected, 0);
    }

    #[test]
    fn test_queries() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker);
        assert!(registry.is_empty());

        registry.register_consumer(consumer_spec("orders")).unwrap();
        registry.register_producer(producer_spec("audit")).unwrap();

        assert_eq!(registry.ids(), vec!["audit", "orders"]);
        assert!(registry.contains("audit"));
        assert!(!registry.contains("payments"));
        assert_eq!(registry.consumers().len(), 1);
        assert_eq!(registry.producers().len(), 1);
        assert_eq!(registry.get("audit").unwrap().kind(), "producer");
    }

    #[test]
    fn test_connector_failure_registers_nothing() {
        let registry = Registry::new(Arc::new(Refusing), RunnerOptions::default());

        let err = registry
            .register(ClientSpec::Consumer(consumer_spec("orders")))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Client { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(registry(&broker));

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || {
                        registry.register_consumer(consumer_spec("shared")).unwrap() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(broker.stats().consumers_connected, 1);
    }
}
