//! `easy-queue` is a queue client, built on top of [`lapin`], that keeps working when the
//! connection to the broker does not.
//!
//! [`QueueClient`] is the best starting point: it publishes messages, consumes queues and
//! settles deliveries, re-establishing the connection transparently before every operation.
//! Consumed messages are dispatched to your [`QueueConsumerDelegate`](consumers::QueueConsumerDelegate),
//! one task per message.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.
mod client;
pub mod codec;
pub mod connection;
pub mod consumers;
mod error;
pub mod publishers;

pub mod amqp;

pub use client::{QueueClient, QueueClientBuilder};
pub use error::{MessageError, QueueError};
