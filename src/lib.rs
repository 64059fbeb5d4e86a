//! `carrot-pool` is a channel pool for RabbitMq, built on top of [`lapin`] and [`deadpool`].
//!
//! On top of plain pooling, it recycles channels once they reach a configured age and
//! fails over to a standby broker when the primary keeps breaking channels, failing back
//! once the primary's management API reports it alive.
//!
//! [`ChannelPool`](crate::pool::ChannelPool) is the best starting point to learn more about
//! what `carrot-pool` provides and how to leverage it.

pub mod amqp;
pub mod health;
pub mod pool;
