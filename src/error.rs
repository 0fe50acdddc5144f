use amq_protocol_types::DeliveryTag;

/// Error returned by the operations exposed by [`QueueClient`](crate::QueueClient) and
/// [`MessageEnvelope`](crate::consumers::MessageEnvelope).
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    /// The client was configured with a combination of parameters that cannot work.
    ///
    /// Raised when building the client, never retried.
    #[error("Invalid queue client configuration: {0}")]
    InvalidConfiguration(String),
    /// A publication was built with both a value to serialize and a pre-serialized payload.
    #[error("Only one of `data` or `serialized` can be specified when publishing a message")]
    InvalidPublication,
    /// The payload exceeds the maximum message length configured for the client.
    #[error("The message payload is {length} bytes long, the maximum allowed is {max_length}")]
    MessageTooLarge { length: usize, max_length: usize },
    /// There is no channel available to talk to the broker.
    #[error("Queue isn't connected to the broker. Did you forget to wait for a connection to be established?")]
    NotConnected,
    /// The message was delivered on a channel that has since been replaced by a reconnect.
    ///
    /// Delivery tags are scoped to the channel that issued them: the broker has already
    /// requeued the message when the old channel went away.
    #[error("Delivery {delivery_tag} was received on channel #{delivery_epoch}, but channel #{current_epoch} is now in use")]
    StaleDelivery {
        delivery_tag: DeliveryTag,
        delivery_epoch: u64,
        current_epoch: u64,
    },
    /// The message has already been acked or rejected.
    #[error("Delivery {0} has already been acked or rejected")]
    AlreadySettled(DeliveryTag),
    /// A consumer with the same tag is already registered on this client.
    #[error("A consumer tagged `{0}` is already registered")]
    DuplicateConsumerTag(String),
    #[error(transparent)]
    Message(#[from] MessageError),
    /// Generic error encountered when interacting with the broker.
    #[error("Generic error encountered when interacting with the broker")]
    Broker(#[source] anyhow::Error),
}

/// Error returned by a [`Codec`](crate::codec::Codec) when a payload cannot be converted.
#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("Failed to serialize the message payload")]
    Serialize(#[source] anyhow::Error),
    #[error("Failed to deserialize the message payload")]
    Deserialize(#[source] anyhow::Error),
}
