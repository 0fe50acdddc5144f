//! Pluggable payload (de)serialization.
use crate::error::MessageError;
use serde::{de::DeserializeOwned, Serialize};

/// Converts message payloads to and from the bytes travelling over the wire.
///
/// [`QueueClient`](crate::QueueClient) serializes data passed to `put` and every
/// [`MessageEnvelope`](crate::consumers::MessageEnvelope) deserializes its body, lazily,
/// through the codec the client was built with.
pub trait Codec<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, MessageError>;

    fn deserialize(&self, body: &[u8]) -> Result<T, MessageError>;

    /// The MIME type stamped on the `content_type` property of published messages.
    fn content_type(&self) -> Option<&str> {
        None
    }
}

/// The default codec: JSON text, UTF-8 encoded.
///
/// Non-ASCII characters are written as-is rather than escaped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(value).map_err(|e| MessageError::Serialize(e.into()))
    }

    fn deserialize(&self, body: &[u8]) -> Result<T, MessageError> {
        serde_json::from_slice(body).map_err(|e| MessageError::Deserialize(e.into()))
    }

    fn content_type(&self) -> Option<&str> {
        Some("application/json")
    }
}
