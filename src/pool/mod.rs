//! Provides pooling for RabbitMq channels, with recycling and failover to a standby broker.
//!
//! This module provides three key guarantees:
//! - Channels older than the recycle interval are replaced before being handed out.
//! - Broken channels are disposed of and replaced, keeping the pool at its full size.
//! - When too many channels break in a short time, new channels are created against the
//!   standby broker until the original one is healthy again.
//!
//! ```rust
//! use carrot_pool::amqp::configuration::{BrokerPoolSettings, PoolSettings};
//! use carrot_pool::amqp::LapinChannelFactory;
//! use carrot_pool::health::AlivenessProbe;
//! use carrot_pool::pool::{ChannelPool, RabbitMqChannelPool};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and pool config.
//!     let settings = BrokerPoolSettings {
//!         pool: PoolSettings {
//!             pool_size: 16,
//!             pool_recycle: 600,
//!             ..PoolSettings::default()
//!         },
//!         ..BrokerPoolSettings::default()
//!     };
//!     let probe = AlivenessProbe::new(15672, std::time::Duration::from_secs(5))?;
//!
//!     let pool: RabbitMqChannelPool =
//!         ChannelPool::builder(settings, LapinChannelFactory::new(), probe)
//!             .build()
//!             .await?;
//!
//!     // get a Channel from the pool, and give it back once done.
//!     let channel = pool.acquire().await?;
//!     pool.release(channel).await;
//!     Ok(())
//! }
//! ```

mod broken;
mod channel;
mod error;
mod failover;
mod manager;
mod recycle;

pub use broken::BrokenEventLog;
pub use channel::PooledChannel;
pub use error::PoolError;
pub use failover::{FailoverError, FailoverPhase, FailoverPolicy, FailoverState};
pub use manager::{ChannelPool, ChannelPoolBuilder, PoolStatus};
pub use recycle::{LookupFailure, RecycleTracker};

/// A [`ChannelPool`] of lapin channels, health checked through the management API.
pub type RabbitMqChannelPool =
    ChannelPool<crate::amqp::LapinChannelFactory, crate::health::AlivenessProbe>;
