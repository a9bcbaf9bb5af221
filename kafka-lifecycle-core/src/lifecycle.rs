//! Bulk start and stop over every registered client.
//!
//! The manager owns the registry and the table of consumer tasks. Stopping happens at most
//! once per manager: consumers are stopped and their tasks joined first, producers are closed
//! afterwards, so callbacks still in flight can use a producer until they finish.

use crate::runtime::{ManagedConsumer, Runner, RunnerOptions};
use crate::{
    ClientConnector, ClientSpec, LifecycleResult, PluginConfig, ProducerRunner, Registry,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Starts and stops every registered client as one unit
pub struct LifecycleManager {
    registry: Registry,
    tasks: DashMap<String, JoinHandle<()>>,
    stopping: AtomicBool,
    /// Shared by `start_all`, exclusive while `stop_all` signals consumers
    start_gate: RwLock<()>,
    shutdown_grace: Duration,
}

impl LifecycleManager {
    pub fn new(connector: Arc<dyn ClientConnector>, config: &PluginConfig) -> Self {
        let options = RunnerOptions {
            poll_timeout: config.poll_timeout(),
        };

        Self {
            registry: Registry::new(connector, options),
            tasks: DashMap::new(),
            stopping: AtomicBool::new(false),
            start_gate: RwLock::new(()),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a client, see [`Registry::register`]
    pub fn register<K: 'static, V: 'static>(&self, spec: ClientSpec<K, V>) -> LifecycleResult<bool> {
        self.registry.register(spec)
    }

    /// Typed handle to a registered producer
    ///
    /// `None` when the id is unknown, names a consumer, or was registered with other types.
    pub fn producer<K: 'static, V: 'static>(&self, id: &str) -> Option<ProducerRunner<K, V>> {
        match self.registry.get(id)? {
            Runner::Producer(producer) => producer
                .as_any()
                .downcast_ref::<ProducerRunner<K, V>>()
                .cloned(),
            Runner::Consumer(_) => None,
        }
    }

    /// Start every consumer that has no task yet and return how many were started
    pub fn start_all(&self) -> usize {
        let _gate = self.start_gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopping() {
            warn!("Lifecycle manager is stopping, ignoring start request");
            return 0;
        }

        let mut started = 0;
        for consumer in self.registry.consumers() {
            match self.tasks.entry(consumer.id().to_string()) {
                Entry::Occupied(_) => debug!("Consumer {} already has a task", consumer.id()),
                Entry::Vacant(slot) => {
                    if let Some(task) = Arc::clone(&consumer).start() {
                        slot.insert(task);
                        started += 1;
                    }
                }
            }
        }

        info!("Started {} consumers", started);
        started
    }

    /// Stop all consumers, wait for their tasks, then close all producers
    ///
    /// Only the first call does the work and returns `true`; concurrent and later calls
    /// return `false` right away.
    pub async fn stop_all(&self) -> bool {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Lifecycle manager is already stopping");
            return false;
        }

        info!("Stopping {} clients", self.registry.len());

        // waits for a running start_all; later ones see the stopping flag
        let consumers = {
            let _gate = self.start_gate.write().unwrap_or_else(PoisonError::into_inner);
            let consumers = self.registry.consumers();
            for consumer in &consumers {
                consumer.stop();
            }
            consumers
        };

        for consumer in &consumers {
            if let Some((_, task)) = self.tasks.remove(consumer.id()) {
                self.join_task(consumer.as_ref(), task).await;
            }
        }

        for producer in self.registry.producers() {
            producer.close().await;
        }

        info!("All clients stopped");
        true
    }

    async fn join_task(&self, consumer: &dyn ManagedConsumer, mut task: JoinHandle<()>) {
        let id = consumer.id();
        match tokio::time::timeout(self.shutdown_grace, &mut task).await {
            Ok(Ok(())) => debug!("Consumer {} task finished", id),
            Ok(Err(e)) => error!("Consumer {} task failed: {}", id, e),
            Err(_) => {
                warn!(
                    "Consumer {} did not stop within {:?}, aborting its task",
                    id, self.shutdown_grace
                );
                task.abort();
                match task.await {
                    Err(e) if e.is_cancelled() => debug!("Consumer {} task aborted", id),
                    Err(e) => error!("Consumer {} task failed: {}", id, e),
                    Ok(()) => debug!("Consumer {} task finished", id),
                }
            }
        }

        // no-op unless the loop ended without its own cleanup
        consumer.force_close().await;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Consumer tasks that have not finished yet
    pub fn running_tasks(&self) -> usize {
        self.tasks.iter().filter(|e| !e.value().is_finished()).count()
    }
}
