//! Everything you need to consume messages: implement [`QueueConsumerDelegate`] and hand it
//! over to [`QueueClient::consume`](crate::QueueClient::consume).
mod delegate;
mod handler;
mod message;

pub use delegate::QueueConsumerDelegate;
pub(crate) use handler::ConsumptionHandler;
pub use message::MessageEnvelope;
