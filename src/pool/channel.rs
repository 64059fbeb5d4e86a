//! The record every pooled resource travels in.
use crate::amqp::PoolResource;
use std::ops::{Deref, DerefMut};
use tokio::time::Instant;
use uuid::Uuid;

/// A resource handed out by a [`ChannelPool`](super::ChannelPool).
///
/// It carries its own recycle deadline, so the bookkeeping lives and dies with the
/// resource itself. Give it back with [`ChannelPool::release`](super::ChannelPool::release)
/// or [`ChannelPool::release_broken`](super::ChannelPool::release_broken); simply dropping
/// it leaks the pool slot it occupied.
#[must_use = "channels must be given back to the pool"]
pub struct PooledChannel<R> {
    id: Uuid,
    resource: R,
    pub(super) recycle_at: Option<Instant>,
}

impl<R> PooledChannel<R> {
    pub(crate) fn new(resource: R) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource,
            recycle_at: None,
        }
    }

    /// Identifier used in logs to follow a resource through its lifecycle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the resource is due for replacement, if pooling with recycling is enabled.
    pub fn recycle_at(&self) -> Option<Instant> {
        self.recycle_at
    }

    /// The pooled resource itself.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub(crate) fn into_resource(self) -> R {
        self.resource
    }
}

impl<R: PoolResource> PooledChannel<R> {
    /// Whether the resource can still be used.
    pub fn is_open(&self) -> bool {
        self.resource.is_open()
    }
}

impl<R> Deref for PooledChannel<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R> DerefMut for PooledChannel<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.resource
    }
}

impl<R> std::fmt::Debug for PooledChannel<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChannel")
            .field("id", &self.id)
            .field("recycle_at", &self.recycle_at)
            .finish_non_exhaustive()
    }
}
