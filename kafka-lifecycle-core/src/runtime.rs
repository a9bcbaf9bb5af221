//! Runners that own one broker handle each.
//!
//! - [`ConsumerRunner`]: subscribes, polls and dispatches records to the handler on its own task
//! - [`ProducerRunner`]: fire-and-forget sends to one destination topic, guarded by a closed flag
//!
//! Both are type-erased behind [`ManagedConsumer`] / [`ManagedProducer`] so that the registry
//! can hold clients with different key and value types side by side.

mod consumer_runner;
mod producer_runner;

pub use consumer_runner::ConsumerRunner;
pub use producer_runner::ProducerRunner;

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Settings shared by every runner created by one registry
#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    /// Upper bound for a single poll call
    pub poll_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Lifecycle surface of a consumer runner
#[async_trait]
pub trait ManagedConsumer: Send + Sync {
    fn id(&self) -> &str;

    /// Start the poll loop on a new task
    ///
    /// Returns `None` without side effects when the consumer is already running.
    fn start(self: Arc<Self>) -> Option<JoinHandle<()>>;

    /// Ask the poll loop to stop; never waits for it
    fn stop(&self);

    /// Close the handle of a loop that was aborted before its own cleanup ran
    ///
    /// Does nothing when the last loop already closed the handle.
    async fn force_close(&self);

    fn is_running(&self) -> bool;
}

/// Lifecycle surface of a producer runner
#[async_trait]
pub trait ManagedProducer: Send + Sync {
    fn id(&self) -> &str;

    /// Close the handle and cancel pending sends; idempotent
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Access to the concrete runner for typed lookups
    fn as_any(&self) -> &dyn Any;
}

/// Registry entry value
#[derive(Clone)]
pub enum Runner {
    Consumer(Arc<dyn ManagedConsumer>),
    Producer(Arc<dyn ManagedProducer>),
}

impl Runner {
    pub fn id(&self) -> &str {
        match self {
            Self::Consumer(consumer) => consumer.id(),
            Self::Producer(producer) => producer.id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Consumer(_) => "consumer",
            Self::Producer(_) => "producer",
        }
    }

    pub fn as_consumer(&self) -> Option<&Arc<dyn ManagedConsumer>> {
        match self {
            Self::Consumer(consumer) => Some(consumer),
            Self::Producer(_) => None,
        }
    }

    pub fn as_producer(&self) -> Option<&Arc<dyn ManagedProducer>> {
        match self {
            Self::Producer(producer) => Some(producer),
            Self::Consumer(_) => None,
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}
