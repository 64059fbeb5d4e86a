//! Recycle deadlines for pooled channels.
use super::PooledChannel;
use std::time::Duration;
use tokio::time::Instant;

/// Returned when checking the deadline of a channel that was never marked.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel {0} has no recycle deadline")]
pub struct LookupFailure(pub uuid::Uuid);

/// Computes and checks the deadline after which a pooled channel must be replaced.
#[derive(Debug, Clone, Copy)]
pub struct RecycleTracker {
    interval: Duration,
}

impl RecycleTracker {
    /// A tracker handing out deadlines `interval` in the future.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Set the recycle deadline of `channel`, `interval` from now unless `deadline` is given.
    pub fn mark<R>(&self, channel: &mut PooledChannel<R>, deadline: Option<Instant>) {
        channel.recycle_at = Some(deadline.unwrap_or_else(|| Instant::now() + self.interval));
    }

    /// Clear the recycle deadline of `channel`.
    pub fn unmark<R>(&self, channel: &mut PooledChannel<R>) {
        channel.recycle_at = None;
    }

    /// Whether the deadline of `channel` has passed.
    ///
    /// Errors if `channel` was never marked.
    pub fn is_expired<R>(&self, channel: &PooledChannel<R>) -> Result<bool, LookupFailure> {
        channel
            .recycle_at
            .map(|deadline| deadline < Instant::now())
            .ok_or_else(|| LookupFailure(channel.id()))
    }
}
