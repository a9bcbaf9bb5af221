//! Kafka relay
//!
//! Reads string records from the consumer section `relay-in` of a TOML config file and
//! republishes them through the producer section `relay-out`. Stops on Ctrl-C.
//!
//! Example config:
//!
//! ```toml
//! bootstrap_servers = "localhost:9092"
//! group_id = "relay"
//!
//! [[consumers]]
//! id = "relay-in"
//! topics = ["events"]
//!
//! [[producers]]
//! id = "relay-out"
//! topic = "events-copy"
//! ```
//!
//! Usage:
//!   cargo run --example kafka_relay --features kafka -- relay.toml

use kafka_lifecycle_core::{
    init_tracing, ConsumerBuilder, KafkaPlugin, Nullable, PluginConfig, ProducerBuilder,
    StringCodec,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "relay.toml".to_string());
    let config = PluginConfig::from_file(&path)?;
    init_tracing(&config.log_level);

    let plugin = KafkaPlugin::with_kafka(config)?;

    let relay_out = plugin.producer_from_section(
        "relay-out",
        |b: &mut ProducerBuilder<Option<String>, String>| {
            b.key_serializer(Nullable(StringCodec))
                .value_serializer(StringCodec)
                .property("linger.ms", "5");
        },
    )?;

    plugin.consumer_from_section(
        "relay-in",
        move |b: &mut ConsumerBuilder<Option<String>, String>| {
            b.key_deserializer(Nullable(StringCodec))
                .value_deserializer(StringCodec)
                .listener(move |key, value| {
                    match key {
                        Some(key) => relay_out.send_with_key(Some(key), value),
                        None => relay_out.send(value),
                    }
                    Ok(())
                });
        },
    )?;

    plugin.on_application_started();

    let signal = tokio::signal::ctrl_c().await;

    plugin.on_application_stopping().await;
    signal?;
    Ok(())
}
