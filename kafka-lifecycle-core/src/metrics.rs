//! Per-client counters and gauges reported through the `metrics` facade.
//!
//! Nothing is exported unless the host application installs a recorder.

use metrics::{counter, gauge};

/// Metrics handle for one registered client, labelled with its id
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    client: String,
}

impl ClientMetrics {
    pub fn new(client_id: &str) -> Self {
        Self {
            client: client_id.to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client
    }

    /// Record that a consumed record was handed to the handler
    pub fn record_received(&self) {
        counter!("kafka_lifecycle_records_received_total", "client" => self.client.clone())
            .increment(1);
    }

    /// Record a successful send acknowledgement
    pub fn record_sent(&self, bytes: usize) {
        counter!("kafka_lifecycle_records_sent_total", "client" => self.client.clone())
            .increment(1);
        counter!("kafka_lifecycle_bytes_sent_total", "client" => self.client.clone())
            .increment(bytes as u64);
    }

    /// Record a send that was skipped because the producer is closed
    pub fn record_dropped(&self) {
        counter!("kafka_lifecycle_records_dropped_total", "client" => self.client.clone())
            .increment(1);
    }

    /// Record an error, labelled with its kind
    pub fn record_error(&self, kind: &str) {
        counter!(
            "kafka_lifecycle_errors_total",
            "client" => self.client.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Flag whether the consumer loop is running
    pub fn set_running(&self, running: bool) {
        gauge!("kafka_lifecycle_consumer_running", "client" => self.client.clone())
            .set(if running { 1.0 } else { 0.0 });
    }
}
