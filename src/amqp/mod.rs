//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
mod factory;
pub use factory::{BrokerChannel, ChannelFactory, LapinChannelFactory, PoolResource};
pub use lapin::{Channel, Connection};
