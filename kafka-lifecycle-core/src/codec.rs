//! Key and value codecs.
//!
//! A consumer is configured with a [`Deserializer`] for keys and one for values, a producer
//! with a [`Serializer`] for each. The codecs provided here cover UTF-8 strings, raw bytes
//! and JSON through serde.

use crate::{LifecycleError, LifecycleResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Decodes raw record bytes into `T`
pub trait Deserializer<T>: Send + Sync {
    /// `data` is `None` when the record has no key or no payload
    fn deserialize(&self, topic: &str, data: Option<&[u8]>) -> LifecycleResult<T>;
}

/// Encodes `T` into raw record bytes
pub trait Serializer<T>: Send + Sync {
    /// `None` sends the key or payload as absent
    fn serialize(&self, topic: &str, data: &T) -> LifecycleResult<Option<Vec<u8>>>;
}

fn absent(topic: &str) -> LifecycleError {
    LifecycleError::InvalidData {
        message: format!("Record from topic {} has no data to decode", topic),
        payload: Vec::new(),
    }
}

/// UTF-8 string codec
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Deserializer<String> for StringCodec {
    fn deserialize(&self, topic: &str, data: Option<&[u8]>) -> LifecycleResult<String> {
        let data = data.ok_or_else(|| absent(topic))?;
        String::from_utf8(data.to_vec()).map_err(|e| LifecycleError::InvalidData {
            message: format!("Payload is not valid UTF-8: {}", e),
            payload: e.into_bytes(),
        })
    }
}

impl Serializer<String> for StringCodec {
    fn serialize(&self, _topic: &str, data: &String) -> LifecycleResult<Option<Vec<u8>>> {
        Ok(Some(data.as_bytes().to_vec()))
    }
}

/// Raw bytes codec; an absent key or payload decodes to an empty buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Deserializer<Vec<u8>> for BytesCodec {
    fn deserialize(&self, _topic: &str, data: Option<&[u8]>) -> LifecycleResult<Vec<u8>> {
        Ok(data.map(<[u8]>::to_vec).unwrap_or_default())
    }
}

impl Serializer<Vec<u8>> for BytesCodec {
    fn serialize(&self, _topic: &str, data: &Vec<u8>) -> LifecycleResult<Option<Vec<u8>>> {
        Ok(Some(data.clone()))
    }
}

/// JSON codec backed by serde_json
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T: DeserializeOwned> Deserializer<T> for JsonCodec<T> {
    fn deserialize(&self, topic: &str, data: Option<&[u8]>) -> LifecycleResult<T> {
        let data = data.ok_or_else(|| absent(topic))?;
        serde_json::from_slice(data).map_err(|e| LifecycleError::InvalidData {
            message: format!("Failed to deserialize JSON from topic {}: {}", topic, e),
            payload: data.to_vec(),
        })
    }
}

impl<T: Serialize> Serializer<T> for JsonCodec<T> {
    fn serialize(&self, topic: &str, data: &T) -> LifecycleResult<Option<Vec<u8>>> {
        serde_json::to_vec(data).map(Some).map_err(|e| {
            LifecycleError::Serialization(format!("Can't serialize JSON for topic {}: {}", topic, e))
        })
    }
}

/// Wraps a codec so that an absent key or payload becomes `None`
#[derive(Debug, Clone, Copy, Default)]
pub struct Nullable<C>(pub C);

impl<T, C: Deserializer<T>> Deserializer<Option<T>> for Nullable<C> {
    fn deserialize(&self, topic: &str, data: Option<&[u8]>) -> LifecycleResult<Option<T>> {
        match data {
            Some(bytes) => self.0.deserialize(topic, Some(bytes)).map(Some),
            None => Ok(None),
        }
    }
}

impl<T, C: Serializer<T>> Serializer<Option<T>> for Nullable<C> {
    fn serialize(&self, topic: &str, data: &Option<T>) -> LifecycleResult<Option<Vec<u8>>> {
        match data {
            Some(value) => self.0.serialize(topic, value),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        order_id: String,
        amount_cents: u64,
    }

    #[test]
    fn test_string_codec() {
        let decoded = StringCodec.deserialize("t", Some(b"hello")).unwrap();
        assert_eq!(decoded, "hello");
        assert_eq!(
            StringCodec.serialize("t", &"hi".to_string()).unwrap(),
            Some(b"hi".to_vec())
        );
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        let err = StringCodec.deserialize("t", Some(&[0xff, 0xfe])).unwrap_err();
        match err {
            LifecycleError::InvalidData { payload, .. } => assert_eq!(payload, vec![0xff, 0xfe]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_string_codec_rejects_absent_data() {
        assert!(StringCodec.deserialize("t", None).is_err());
    }

    #[test]
    fn test_bytes_codec_absent_is_empty() {
        assert!(BytesCodec.deserialize("t", None).unwrap().is_empty());
        assert_eq!(BytesCodec.deserialize("t", Some(b"ab")).unwrap(), b"ab");
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec::<Order>::new();
        let order = Order {
            order_id: "o-1".to_string(),
            amount_cents: 1250,
        };

        let bytes = codec.serialize("orders", &order).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["order_id"], "o-1");
        assert_eq!(json["amount_cents"], 1250);

        let decoded = codec
            .deserialize("orders", Some(br#"{"order_id":"o-2","amount_cents":5}"#))
            .unwrap();
        assert_eq!(decoded.order_id, "o-2");
    }

    #[test]
    fn test_json_codec_invalid() {
        let codec = JsonCodec::<Order>::new();
        let err = codec.deserialize("orders", Some(b"not json")).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidData { .. }));
    }

    #[test]
    fn test_nullable_codec() {
        let codec = Nullable(StringCodec);
        let none: Option<String> = codec.deserialize("t", None).unwrap();
        assert!(none.is_none());

        let some: Option<String> = codec.deserialize("t", Some(b"k")).unwrap();
        assert_eq!(some.as_deref(), Some("k"));
    }

    #[test]
    fn test_nullable_none_stays_absent() {
        let codec = Nullable(StringCodec);

        let encoded = codec.serialize("t", &None::<String>).unwrap();
        assert!(encoded.is_none());
        let decoded: Option<String> = codec.deserialize("t", encoded.as_deref()).unwrap();
        assert!(decoded.is_none());

        let encoded = codec.serialize("t", &Some(String::new())).unwrap();
        assert_eq!(encoded, Some(Vec::new()));
        let decoded: Option<String> = codec.deserialize("t", encoded.as_deref()).unwrap();
        assert_eq!(decoded.as_deref(), Some(""));
    }
}
