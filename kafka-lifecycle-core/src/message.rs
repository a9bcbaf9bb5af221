//! Record types exchanged with broker handles.
//!
//! Handles work on raw bytes: a consumer handle yields [`ConsumedRecord`]s and a producer
//! handle accepts [`OutgoingRecord`]s. Runners apply the configured codecs on either side.

use std::fmt;

/// Record fetched by a consumer handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    /// Topic the record was read from
    pub topic: String,
    /// Partition, when the broker reports one
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Raw key bytes, if the record has a key
    pub key: Option<Vec<u8>>,
    /// Raw payload bytes, if the record is not a tombstone
    pub payload: Option<Vec<u8>>,
}

impl ConsumedRecord {
    /// Create a record without position information
    pub fn new(topic: impl Into<String>, key: Option<Vec<u8>>, payload: Option<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key,
            payload,
        }
    }

    /// Set partition and offset
    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// Typed record handed to a producer runner
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord<K, V> {
    pub topic: String,
    pub key: Option<K>,
    pub value: V,
}

impl<K, V> ProducerRecord<K, V> {
    /// Create a record without a key
    pub fn new(topic: impl Into<String>, value: V) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value,
        }
    }

    /// Set the record key
    pub fn with_key(mut self, key: K) -> Self {
        self.key = Some(key);
        self
    }
}

/// Encoded record passed to a producer handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    /// `None` sends a tombstone
    pub payload: Option<Vec<u8>>,
}

impl OutgoingRecord {
    pub fn size(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.len()) + self.key.as_ref().map_or(0, |k| k.len())
    }
}

/// Broker acknowledgement for a sent record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "topic: '{}', partition: '{}', offset: '{}'",
            self.topic, self.partition, self.offset
        )
    }
}
