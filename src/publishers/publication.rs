use crate::codec::Codec;
use crate::error::QueueError;
use lapin::BasicProperties;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// A message to be published via [`QueueClient::put`](crate::QueueClient::put).
///
/// Exactly one of [`Publication::data`] or [`Publication::serialized`] must be provided:
/// the former goes through the client's codec, the latter is sent as-is.
///
/// ```rust
/// use easy_queue::publishers::Publication;
/// use serde_json::json;
///
/// let publication = Publication::new("orders.created")
///     .exchange("orders")
///     .data(json!({"id": 42}));
/// ```
#[derive(Debug, Clone)]
pub struct Publication<T> {
    routing_key: String,
    exchange: String,
    data: Option<T>,
    serialized: Option<Vec<u8>>,
    properties: BasicProperties,
}

impl<T: 'static> Publication<T> {
    /// Start building a publication for `routing_key`, on the default exchange.
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            exchange: String::new(),
            data: None,
            serialized: None,
            properties: BasicProperties::default(),
        }
    }

    /// The exchange to publish to. Defaults to the default exchange (`""`).
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// A value to be serialized with the client's codec.
    #[must_use]
    pub fn data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }

    /// A payload that has already been serialized.
    #[must_use]
    pub fn serialized(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.serialized = Some(payload.into());
        self
    }

    /// AMQP properties to attach to the message.
    ///
    /// `message_id` and `timestamp` are filled in at publishing time when left unset.
    #[must_use]
    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Validate and serialize the publication. Nothing here touches the network.
    ///
    /// `max_message_length == 0` disables the length check.
    pub(crate) fn prepare(
        self,
        codec: &dyn Codec<T>,
        max_message_length: usize,
    ) -> Result<PreparedPublication, QueueError> {
        let (payload, properties) = match (self.data, self.serialized) {
            (Some(data), None) => {
                let payload = codec.serialize(&data)?;
                let properties = match codec.content_type() {
                    Some(content_type) if self.properties.content_type().is_none() => {
                        self.properties.with_content_type(content_type.into())
                    }
                    _ => self.properties,
                };
                (payload, properties)
            }
            (None, Some(payload)) => (payload, self.properties),
            _ => return Err(QueueError::InvalidPublication),
        };
        if max_message_length > 0 && payload.len() > max_message_length {
            return Err(QueueError::MessageTooLarge {
                length: payload.len(),
                max_length: max_message_length,
            });
        }
        Ok(PreparedPublication {
            routing_key: self.routing_key,
            exchange: self.exchange,
            payload,
            properties: inject_amqp_properties(properties),
        })
    }
}

/// A publication ready to go over the wire.
#[derive(Debug)]
pub(crate) struct PreparedPublication {
    pub(crate) routing_key: String,
    pub(crate) exchange: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) properties: BasicProperties,
}

fn inject_amqp_properties(props: BasicProperties) -> BasicProperties {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
}
