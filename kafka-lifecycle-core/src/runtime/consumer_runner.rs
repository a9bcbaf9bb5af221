//! Consumer runner: one poll loop per registered consumer.
//!
//! The loop runs on its own tokio task. It subscribes, then polls the handle and hands every
//! record of a batch to the handler in the order the handle returned them. Any poll, decode
//! or handler failure (including a handler panic) is logged and ends the loop. Whatever the
//! exit reason, the handle is closed exactly once and the running flag is cleared.

use crate::builder::ConsumerParts;
use crate::metrics::ClientMetrics;
use crate::runtime::{ManagedConsumer, RunnerOptions};
use crate::{
    ConsumedRecord, ConsumerHandle, ConsumerSpec, Deserializer, LifecycleError, LifecycleResult,
    RecordHandler,
};
use async_trait::async_trait;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owns one consumer handle and its poll loop
pub struct ConsumerRunner<K, V> {
    id: String,
    topics: Vec<String>,
    poll_timeout: Duration,
    handle: Arc<tokio::sync::Mutex<Box<dyn ConsumerHandle>>>,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    handler: Arc<dyn RecordHandler<K, V>>,
    running: AtomicBool,
    /// Bumped on every start so a finishing loop only resets state it owns
    generation: AtomicU64,
    /// Last generation whose loop closed the handle
    closed_generation: AtomicU64,
    /// Cancellation for the current loop; start, stop and loop exit lock it
    cancel: Mutex<Option<CancellationToken>>,
    metrics: ClientMetrics,
}

impl<K: 'static, V: 'static> ConsumerRunner<K, V> {
    /// Wrap a connected handle
    pub fn new(
        spec: ConsumerSpec<K, V>,
        handle: Box<dyn ConsumerHandle>,
        options: RunnerOptions,
    ) -> Self {
        let ConsumerParts {
            settings,
            key_deserializer,
            value_deserializer,
            handler,
        } = spec.into_parts();

        Self {
            metrics: ClientMetrics::new(&settings.id),
            id: settings.id,
            topics: settings.topics,
            poll_timeout: options.poll_timeout,
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
            key_deserializer,
            value_deserializer,
            handler,
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            closed_generation: AtomicU64::new(0),
            cancel: Mutex::new(None),
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    fn cancel_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, token: CancellationToken, generation: u64) {
        let mut handle = self.handle.lock().await;

        match handle.subscribe(&self.topics).await {
            Ok(()) => {
                info!("Consumer {} subscribed to {:?}", self.id, self.topics);
                self.poll_loop(&mut **handle, &token).await;
            }
            Err(e) => {
                error!("Consumer {} failed to subscribe: {}", self.id, e);
                self.metrics.record_error("subscribe");
            }
        }

        // cleanup
        handle.close().await;
        self.closed_generation.store(generation, Ordering::Release);
        drop(handle);
        self.finish(generation);
    }

    async fn poll_loop(&self, handle: &mut dyn ConsumerHandle, token: &CancellationToken) {
        while self.running.load(Ordering::Acquire) {
            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                polled = handle.poll(self.poll_timeout) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    error!("Consumer {} poll failed, leaving poll loop: {}", self.id, e);
                    self.metrics.record_error("poll");
                    return;
                }
            };

            if !records.is_empty() {
                debug!("Consumer {} polled {} records", self.id, records.len());
            }

            for record in &records {
                if let Err(e) = self.dispatch(record) {
                    error!(
                        "Consumer {} failed on {}[{}]@{}, leaving poll loop: {}",
                        self.id, record.topic, record.partition, record.offset, e
                    );
                    self.metrics.record_error("dispatch");
                    return;
                }
            }
        }
    }

    /// Decode one record and run the handler on it
    fn dispatch(&self, record: &ConsumedRecord) -> LifecycleResult<()> {
        let key = self.key_deserializer.deserialize(&record.topic, record.key())?;
        let value = self
            .value_deserializer
            .deserialize(&record.topic, record.payload())?;
        self.metrics.record_received();

        let handler = &self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(key, value))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::handler_failed(e)),
            Err(panic) => Err(LifecycleError::delivery(format!(
                "Record handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn finish(&self, generation: u64) {
        let mut slot = self.cancel_slot();
        if self.generation.load(Ordering::Acquire) == generation {
            *slot = None;
            self.running.store(false, Ordering::Release);
            self.metrics.set_running(false);
        }
        info!("Consumer {} stopped", self.id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl<K: 'static, V: 'static> ManagedConsumer for ConsumerRunner<K, V> {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Consumer {} cannot start outside a tokio runtime: {}", self.id, e);
                return None;
            }
        };

        let token = CancellationToken::new();
        let generation = {
            let mut slot = self.cancel_slot();
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                warn!("Consumer {} is already running, ignoring start", self.id);
                return None;
            }
            *slot = Some(token.clone());
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        info!("Starting consumer {} on {:?}", self.id, self.topics);
        self.metrics.set_running(true);
        Some(runtime.spawn(self.run(token, generation)))
    }

    fn stop(&self) {
        let token = {
            let mut slot = self.cancel_slot();
            self.running.store(false, Ordering::Release);
            slot.take()
        };

        match token {
            Some(token) => {
                info!("Stopping consumer {}", self.id);
                token.cancel();
            }
            None => debug!("Consumer {} is not running, nothing to stop", self.id),
        }
    }

    async fn force_close(&self) {
        let mut handle = self.handle.lock().await;
        let generation = self.generation.load(Ordering::Acquire);
        if self.closed_generation.load(Ordering::Acquire) >= generation {
            return;
        }

        warn!("Consumer {} loop ended before cleanup, closing its handle", self.id);
        handle.close().await;
        self.closed_generation.store(generation, Ordering::Release);
        drop(handle);
        self.finish(generation);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::wait_until;
    use crate::{BoxError, ClientConnector, ConsumerBuilder, MemoryBroker, PluginDefaults, StringCodec};

    type Seen = Arc<std::sync::Mutex<Vec<(String, String)>>>;

    fn runner<F>(broker: &MemoryBroker, poll_ms: u64, handler: F) -> Arc<ConsumerRunner<String, String>>
    where
        F: Fn(String, String) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let mut builder = ConsumerBuilder::new(PluginDefaults::default());
        builder
            .id("orders-consumer")
            .bootstrap_servers("memory")
            .group_id("billing")
            .topics(["orders"])
            .key_deserializer(StringCodec)
            .value_deserializer(StringCodec)
            .listener(handler);
        let spec = builder.build().unwrap();
        let handle = broker.connect_consumer(spec.settings()).unwrap();

        Arc::new(ConsumerRunner::new(
            spec,
            handle,
            RunnerOptions {
                poll_timeout: Duration::from_millis(poll_ms),
            },
        ))
    }

    fn recording() -> (Seen, impl Fn(String, String) -> Result<(), BoxError> + Send + Sync) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let handler = move |key: String, value: String| {
            sink.lock().unwrap().push((key, value));
            Ok(())
        };
        (seen, handler)
    }

    #[tokio::test]
    async fn test_records_dispatched_in_order_then_closed_once() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a", "1");
        broker.publish("orders", "b", "2");

        let (seen, handler) = recording();
        let runner = runner(&broker, 10, handler);

        let task = Arc::clone(&runner).start().unwrap();
        wait_until(|| seen.lock().unwrap().len() == 2).await;
        assert!(runner.is_running());

        runner.stop();
        task.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
        assert_eq!(broker.stats().consumer_closes, 1);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_subscribes_once() {
        let broker = MemoryBroker::new();
        let (_seen, handler) = recording();
        let runner = runner(&broker, 10, handler);

        let task = Arc::clone(&runner).start();
        assert!(task.is_some());
        assert!(Arc::clone(&runner).start().is_none());

        wait_until(|| broker.stats().polls >= 2).await;
        assert_eq!(broker.stats().subscribes, 1);

        runner.stop();
        task.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_stop_closes_once() {
        let broker = MemoryBroker::new();
        let (_seen, handler) = recording();
        let runner = runner(&broker, 10, handler);

        runner.stop();
        let task = Arc::clone(&runner).start().unwrap();
        wait_until(|| broker.stats().subscribes == 1).await;

        runner.stop();
        runner.stop();
        task.await.unwrap();

        assert_eq!(broker.stats().consumer_closes, 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_pending_poll() {
        let broker = MemoryBroker::new();
        let (_seen, handler) = recording();
        let runner = runner(&broker, 60_000, handler);

        let task = Arc::clone(&runner).start().unwrap();
        wait_until(|| broker.stats().polls == 1).await;

        runner.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("poll loop should observe cancellation")
            .unwrap();
        assert_eq!(broker.stats().consumer_closes, 1);
    }

    #[tokio::test]
    async fn test_handler_error_ends_loop() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a", "1");
        broker.publish("orders", "b", "2");

        let (seen, _) = recording();
        let sink = Arc::clone(&seen);
        let runner = runner(&broker, 10, move |key, value| {
            sink.lock().unwrap().push((key, value));
            Err("downstream unavailable".into())
        });

        let task = Arc::clone(&runner).start().unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(broker.stats().consumer_closes, 1);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a", "1");

        let runner = runner(&broker, 10, |_key, _value| panic!("handler bug"));

        let task = Arc::clone(&runner).start().unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();

        assert!(joined.is_ok());
        assert_eq!(broker.stats().consumer_closes, 1);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_poll_failure_ends_loop() {
        let broker = MemoryBroker::new();
        broker.fail_next_poll("broker went away");
        let (_seen, handler) = recording();
        let runner = runner(&broker, 10, handler);

        let task = Arc::clone(&runner).start().unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.stats().consumer_closes, 1);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_undecodable_record_ends_loop() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a", [0xffu8, 0xfe]);
        let (seen, handler) = recording();
        let runner = runner(&broker, 10, handler);

        let task = Arc::clone(&runner).start().unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(broker.stats().consumer_closes, 1);
    }

    #[tokio::test]
    async fn test_force_close_after_clean_exit_is_noop() {
        let broker = MemoryBroker::new();
        let (_seen, handler) = recording();
        let runner = runner(&broker, 10, handler);

        runner.force_close().await;
        assert_eq!(broker.stats().consumer_closes, 0);

        let task = Arc::clone(&runner).start().unwrap();
        wait_until(|| broker.stats().subscribes == 1).await;
        runner.stop();
        task.await.unwrap();

        runner.force_close().await;
        assert_eq!(broker.stats().consumer_closes, 1);
    }

    #[tokio::test]
    async fn test_force_close_after_abort_closes_handle() {
        let broker = MemoryBroker::new();
        let (_seen, handler) = recording();
        let runner = runner(&broker, 60_000, handler);

        let task = Arc::clone(&runner).start().unwrap();
        wait_until(|| broker.stats().polls == 1).await;

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(broker.stats().consumer_closes, 0);
        assert!(runner.is_running());

        runner.force_close().await;
        runner.force_close().await;
        assert_eq!(broker.stats().consumer_closes, 1);
        assert!(!runner.is_running());
    }

    #[test]
    fn test_start_outside_runtime_is_refused() {
        let broker = MemoryBroker::new();
        let (_seen, handler) = recording();
        let runner = runner(&broker, 10, handler);

        assert!(Arc::clone(&runner).start().is_none());
        assert!(!runner.is_running());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
