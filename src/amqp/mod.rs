//! Helpers for connecting to a RabbitMq broker with `lapin`.

mod channel;
pub mod configuration;
mod factory;
pub use channel::LapinChannel;
pub use factory::ConnectionFactory;

pub use lapin::{options, types, BasicProperties};
