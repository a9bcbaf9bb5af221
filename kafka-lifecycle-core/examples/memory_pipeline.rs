//! In-process order pipeline
//!
//! Runs a consumer and a producer against the in-memory broker: orders are read from the
//! `orders` topic as JSON, priced, and forwarded to `orders-audit`, where a second consumer
//! prints them. No Kafka broker is needed.
//!
//! Usage:
//!   cargo run --example memory_pipeline

use kafka_lifecycle_core::{
    init_tracing, ConsumerBuilder, JsonCodec, KafkaPlugin, MemoryBroker, PluginConfig,
    ProducerBuilder, StringCodec,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    order_id: String,
    quantity: u32,
    unit_price_cents: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditEntry {
    order_id: String,
    total_cents: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let config = PluginConfig {
        bootstrap_servers: Some("memory".to_string()),
        group_id: Some("order-pipeline".to_string()),
        poll_timeout_ms: 50,
        ..Default::default()
    };
    let broker = MemoryBroker::new();
    let plugin = KafkaPlugin::new(config, Arc::new(broker.clone()))?;

    let audit = plugin.producer(|b: &mut ProducerBuilder<String, AuditEntry>| {
        b.id("audit-producer")
            .topic("orders-audit")
            .key_serializer(StringCodec)
            .value_serializer(JsonCodec::new());
    })?;

    plugin.consumer(move |b: &mut ConsumerBuilder<String, Order>| {
        b.id("order-pricer")
            .topics(["orders"])
            .key_deserializer(StringCodec)
            .value_deserializer(JsonCodec::new())
            .listener(move |customer, order| {
                let entry = AuditEntry {
                    total_cents: order.unit_price_cents * u64::from(order.quantity),
                    order_id: order.order_id,
                };
                audit.send_with_key(customer, entry);
                Ok(())
            });
    })?;

    plugin.consumer(|b: &mut ConsumerBuilder<String, AuditEntry>| {
        b.id("audit-printer")
            .group_id("audit-readers")
            .topics(["orders-audit"])
            .key_deserializer(StringCodec)
            .value_deserializer(JsonCodec::new())
            .listener(|customer, entry| {
                println!(
                    "{} ordered {} for {}.{:02}",
                    customer,
                    entry.order_id,
                    entry.total_cents / 100,
                    entry.total_cents % 100
                );
                Ok(())
            });
    })?;

    plugin.on_application_started();

    for (i, customer) in ["alice", "bob", "carol"].iter().enumerate() {
        let order = Order {
            order_id: format!("o-{}", i + 1),
            quantity: (i as u32) + 1,
            unit_price_cents: 1999,
        };
        let payload = serde_json::to_vec(&order)?;
        broker.publish("orders", customer, payload);
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    plugin.on_application_stopping().await;
    println!("Broker stats: {:?}", broker.stats());
    Ok(())
}
