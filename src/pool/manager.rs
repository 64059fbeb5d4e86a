use super::broken::BrokenEventLog;
use super::failover::{FailoverPhase, FailoverPolicy, FailoverState};
use super::recycle::RecycleTracker;
use super::{PoolError, PooledChannel};
use crate::amqp::configuration::{BrokerPoolSettings, ConnectionParameters};
use crate::amqp::ChannelFactory;
use crate::health::{HealthProbe, ProbeOutcome};
use deadpool::unmanaged;
use futures_util::future::try_join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// What a pool slot holds while no caller owns it.
enum Slot<R> {
    Ready(PooledChannel<R>),
    /// A slot whose channel could not be (re)created, filled on its next acquisition.
    Vacant,
}

struct Slots<R> {
    pool: unmanaged::Pool<Slot<R>>,
    recycle: RecycleTracker,
    size: usize,
}

/// A pool of RabbitMq channels that recycles stale channels, replaces broken ones and
/// fails over to a standby broker when too many channels break in a short time.
///
/// `ChannelPool` is a cheap handle: clone it to share the pool across tasks.
///
/// # Lifecycle of a channel
///
/// [`acquire`](Self::acquire) waits for a channel, replacing it first if it is older than
/// the recycle interval or no longer open. Callers give it back with
/// [`release`](Self::release) once done, or with [`release_broken`](Self::release_broken)
/// if it turned out to be unusable; the latter destroys it and puts a fresh channel in
/// the pool.
///
/// # Failover
///
/// When a standby is configured, every broken channel is recorded. Once `tolerance`
/// channels broke within `tolerance_interval_seconds`, new channels are created against
/// the standby. While failed over, every `failback_threshold` returns the original primary
/// is health checked through the [`HealthProbe`]; channels go back to it as soon as it
/// reports healthy.
pub struct ChannelPool<F: ChannelFactory, P> {
    inner: Arc<Inner<F, P>>,
}

impl<F: ChannelFactory, P> Clone for ChannelPool<F, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<F: ChannelFactory, P> {
    factory: F,
    probe: P,
    /// `None` when pooling is disabled.
    slots: Option<Slots<F::Resource>>,
    broken: Mutex<BrokenEventLog>,
    failover: Mutex<FailoverState>,
    max_reopen_attempts: u32,
    reopen_backoff: Duration,
}

/// A snapshot of the state of a [`ChannelPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of pool slots, `0` when pooling is disabled.
    pub max_size: usize,
    /// Number of slots waiting in the pool.
    pub available: usize,
    pub phase: FailoverPhase,
    pub failback_counter: u32,
}

impl<F: ChannelFactory, P: HealthProbe> ChannelPool<F, P> {
    /// Start building a [`ChannelPool`].
    pub fn builder(
        settings: BrokerPoolSettings,
        factory: F,
        probe: P,
    ) -> ChannelPoolBuilder<F, P> {
        ChannelPoolBuilder {
            settings,
            factory,
            probe,
            prepopulate: true,
        }
    }

    /// Get a channel.
    ///
    /// With pooling enabled this waits until a channel is available. Otherwise a new
    /// channel is created on every call.
    pub async fn acquire(&self) -> Result<PooledChannel<F::Resource>, PoolError> {
        match &self.inner.slots {
            None => self.create_channel().await,
            Some(slots) => {
                let slot = slots.pool.remove().await?;
                self.check_out(slots, slot).await
            }
        }
    }

    /// Same as [`acquire`](Self::acquire), giving up with [`PoolError::Timeout`] if no
    /// channel becomes available within `timeout`.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledChannel<F::Resource>, PoolError> {
        match &self.inner.slots {
            None => self.create_channel().await,
            Some(slots) => {
                let slot = tokio::time::timeout(timeout, slots.pool.remove())
                    .await
                    .map_err(|_| PoolError::Timeout)??;
                self.check_out(slots, slot).await
            }
        }
    }

    /// Give back a channel that is still usable.
    ///
    /// Closed channels are handled as if passed to [`release_broken`](Self::release_broken).
    /// Without pooling the channel is destroyed.
    pub async fn release(&self, channel: PooledChannel<F::Resource>) {
        self.count_towards_failback().await;
        match &self.inner.slots {
            Some(slots) => {
                debug!(channel = %channel.id(), "Returning RabbitMq channel to the pool");
                if channel.is_open() {
                    self.put_back(slots, Slot::Ready(channel)).await;
                } else {
                    self.release_broken(channel).await;
                }
            }
            None => self.destroy(channel).await,
        }
    }

    /// Give back a channel that can no longer be used.
    ///
    /// The channel is destroyed and, with pooling enabled, replaced by a new one created
    /// against the current primary.
    pub async fn release_broken(&self, channel: PooledChannel<F::Resource>) {
        warn!(channel = %channel.id(), "RabbitMq channel returned in broken state");
        let policy = self.failover_policy();
        if policy.is_some() {
            lock(&self.inner.broken).record_broken_now();
        }
        self.destroy(channel).await;

        if let Some(policy) = policy {
            if self.is_failed_over() {
                debug!("Already failed over");
                self.count_towards_failback().await;
            } else {
                self.evaluate_tolerance(policy);
            }
        }

        if let Some(slots) = &self.inner.slots {
            let slot = match self.create_channel().await {
                Ok(channel) => Slot::Ready(channel),
                Err(e) => {
                    warn!(
                        error = ?e,
                        "Failed to replace a broken RabbitMq channel, the slot will be refilled on its next acquisition"
                    );
                    Slot::Vacant
                }
            };
            self.put_back(slots, slot).await;
        }
    }

    /// Destroy idle channels and refuse any further acquisition.
    ///
    /// Channels still checked out are destroyed when they are given back.
    pub async fn close(&self) {
        let Some(slots) = &self.inner.slots else {
            return;
        };
        while let Ok(slot) = slots.pool.try_remove() {
            if let Slot::Ready(channel) = slot {
                self.destroy(channel).await;
            }
        }
        slots.pool.close();
        debug!("Closed the RabbitMq channel pool");
    }

    /// Snapshot of the pool size, idle channels and failover phase.
    pub fn status(&self) -> PoolStatus {
        let (max_size, available) = match &self.inner.slots {
            Some(slots) => {
                let status = slots.pool.status();
                (slots.size, status.available.max(0) as usize)
            }
            None => (0, 0),
        };
        let failover = lock(&self.inner.failover);
        PoolStatus {
            max_size,
            available,
            phase: failover.phase(),
            failback_counter: failover.failback_counter(),
        }
    }

    /// Whether channels are currently created against the standby.
    pub fn is_failed_over(&self) -> bool {
        lock(&self.inner.failover).is_failed_over()
    }

    /// The endpoint new channels are currently created against.
    pub fn current_endpoint(&self) -> Arc<ConnectionParameters> {
        Arc::clone(lock(&self.inner.failover).current_primary())
    }

    /// Recycle, extend or reopen the channel held by `slot` before handing it out.
    ///
    /// If this fails, or the caller stops waiting, the slot goes back to the pool empty.
    async fn check_out(
        &self,
        slots: &Slots<F::Resource>,
        slot: Slot<F::Resource>,
    ) -> Result<PooledChannel<F::Resource>, PoolError> {
        let vacancy = Vacancy::new(&slots.pool);
        let channel = match slot {
            Slot::Vacant => {
                debug!("Filling an empty pool slot");
                self.create_channel().await?
            }
            Slot::Ready(channel) if self.is_expired(slots, &channel) => {
                let old = channel.id();
                self.destroy(channel).await;
                let channel = self.create_channel().await?;
                debug!(%old, new = %channel.id(), "RabbitMq channel is too old, recycled it");
                channel
            }
            Slot::Ready(mut channel) => {
                slots.recycle.mark(&mut channel, None);
                channel
            }
        };
        let channel = self.ensure_open(channel).await?;
        vacancy.fill();
        Ok(channel)
    }

    fn is_expired(&self, slots: &Slots<F::Resource>, channel: &PooledChannel<F::Resource>) -> bool {
        slots.recycle.is_expired(channel).unwrap_or_else(|e| {
            warn!(error = %e, "Recycling a pooled channel");
            true
        })
    }

    /// Replace `channel` until an open one is obtained, backing off exponentially
    /// between attempts.
    async fn ensure_open(
        &self,
        mut channel: PooledChannel<F::Resource>,
    ) -> Result<PooledChannel<F::Resource>, PoolError> {
        let mut attempts = 0;
        let mut backoff = self.inner.reopen_backoff;
        while !channel.is_open() {
            if attempts == self.inner.max_reopen_attempts {
                self.destroy(channel).await;
                return Err(PoolError::Connect(anyhow::anyhow!(
                    "RabbitMq channel still not open after {attempts} replacements"
                )));
            }
            if attempts > 0 {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            attempts += 1;
            let old = channel.id();
            self.destroy(channel).await;
            channel = self.create_channel().await?;
            warn!(%old, new = %channel.id(), "RabbitMq channel not open, replaced it");
        }
        Ok(channel)
    }

    async fn create_channel(&self) -> Result<PooledChannel<F::Resource>, PoolError> {
        let endpoint = self.current_endpoint();
        let resource = self
            .inner
            .factory
            .create(&endpoint)
            .await
            .map_err(PoolError::Connect)?;
        let mut channel = PooledChannel::new(resource);
        if let Some(slots) = &self.inner.slots {
            slots.recycle.mark(&mut channel, None);
        }
        debug!(channel = %channel.id(), host = %endpoint.host, "Created RabbitMq channel");
        Ok(channel)
    }

    async fn destroy(&self, mut channel: PooledChannel<F::Resource>) {
        let id = channel.id();
        if let Some(slots) = &self.inner.slots {
            slots.recycle.unmark(&mut channel);
        }
        match self.inner.factory.destroy(channel.into_resource()).await {
            Ok(()) => debug!(channel = %id, "Destroyed RabbitMq channel"),
            Err(e) => warn!(channel = %id, error = ?e, "Failed to destroy RabbitMq channel cleanly"),
        }
    }

    async fn put_back(&self, slots: &Slots<F::Resource>, slot: Slot<F::Resource>) {
        if let Err((slot, e)) = slots.pool.try_add(slot) {
            warn!(error = %e, "Could not put a RabbitMq channel back in the pool");
            if let Slot::Ready(channel) = slot {
                self.destroy(channel).await;
            }
        }
    }

    fn failover_policy(&self) -> Option<FailoverPolicy> {
        lock(&self.inner.failover).policy()
    }

    fn evaluate_tolerance(&self, policy: FailoverPolicy) {
        let breached = lock(&self.inner.broken)
            .within_tolerance(policy.tolerance, policy.tolerance_interval);
        debug!(breached, "Checked RabbitMq broken channel tolerance");
        if !breached {
            return;
        }
        let mut failover = lock(&self.inner.failover);
        // Another task may have failed over since the tolerance was checked.
        if failover.is_failed_over() {
            return;
        }
        if let Err(e) = failover.trigger_failover("failover") {
            warn!(error = %e, "RabbitMq failover failed");
        }
    }

    async fn count_towards_failback(&self) {
        let Some(original) = self.record_return() else {
            return;
        };
        warn!(host = %original.host, "Checking whether the original RabbitMq host is back");
        match self.inner.probe.probe(&original).await {
            ProbeOutcome::Healthy => self.fail_back(),
            ProbeOutcome::Unhealthy => {
                warn!(host = %original.host, "Original RabbitMq host is still unhealthy")
            }
            ProbeOutcome::ProbeError(e) => warn!(
                host = %original.host,
                error = ?e,
                "Could not check the original RabbitMq host"
            ),
        }
    }

    fn record_return(&self) -> Option<Arc<ConnectionParameters>> {
        lock(&self.inner.failover).record_return()
    }

    fn fail_back(&self) {
        if let Err(e) = lock(&self.inner.failover).trigger_failback() {
            debug!(error = %e, "Skipped RabbitMq failback");
        }
    }
}

/// A builder for [`ChannelPool`].
///
/// Use [`ChannelPool::builder`] as entrypoint.
pub struct ChannelPoolBuilder<F, P> {
    settings: BrokerPoolSettings,
    factory: F,
    probe: P,
    prepopulate: bool,
}

impl<F: ChannelFactory, P: HealthProbe> ChannelPoolBuilder<F, P> {
    /// Whether to open every pooled channel when building the pool.
    ///
    /// Defaults to `true`. When disabled, slots start empty and are filled on their
    /// first acquisition, so the pool can be built while the broker is unreachable.
    #[must_use]
    pub fn prepopulate(mut self, prepopulate: bool) -> Self {
        self.prepopulate = prepopulate;
        self
    }

    /// Finalise the builder and get an instance of [`ChannelPool`].
    ///
    /// Fails if prepopulating the pool fails.
    pub async fn build(self) -> Result<ChannelPool<F, P>, PoolError> {
        let BrokerPoolSettings {
            primary,
            pool,
            failover,
        } = self.settings;
        let primary = primary.into_connection_parameters();
        let (failover, log_capacity) = match failover {
            Some(settings) => {
                let policy = FailoverPolicy::from(&settings);
                let standby = settings.standby.into_connection_parameters();
                (
                    FailoverState::new(primary, standby, policy),
                    policy.tolerance as usize,
                )
            }
            None => (FailoverState::without_standby(primary), 1),
        };
        let slots = match pool.recycle_interval() {
            Some(_) if pool.pool_size == 0 => {
                return Err(PoolError::Configuration(
                    "pool_size must be at least 1 when pooling is enabled".into(),
                ))
            }
            Some(interval) => Some(Slots {
                pool: unmanaged::Pool::new(pool.pool_size),
                recycle: RecycleTracker::new(interval),
                size: pool.pool_size,
            }),
            None => None,
        };

        let channel_pool = ChannelPool {
            inner: Arc::new(Inner {
                factory: self.factory,
                probe: self.probe,
                slots,
                broken: Mutex::new(BrokenEventLog::new(log_capacity)),
                failover: Mutex::new(failover),
                max_reopen_attempts: pool.max_reopen_attempts,
                reopen_backoff: pool.reopen_backoff(),
            }),
        };

        if let Some(slots) = &channel_pool.inner.slots {
            let initial: Vec<_> = if self.prepopulate {
                try_join_all((0..slots.size).map(|_| channel_pool.create_channel()))
                    .await?
                    .into_iter()
                    .map(Slot::Ready)
                    .collect()
            } else {
                (0..slots.size).map(|_| Slot::Vacant).collect()
            };
            for slot in initial {
                channel_pool.put_back(slots, slot).await;
            }
            debug!(
                pool_size = slots.size,
                prepopulated = self.prepopulate,
                "Built RabbitMq channel pool"
            );
        }
        Ok(channel_pool)
    }
}

/// Gives an empty slot back to the pool unless [`fill`](Vacancy::fill)ed first.
struct Vacancy<'a, R> {
    pool: &'a unmanaged::Pool<Slot<R>>,
    filled: bool,
}

impl<'a, R> Vacancy<'a, R> {
    fn new(pool: &'a unmanaged::Pool<Slot<R>>) -> Self {
        Self {
            pool,
            filled: false,
        }
    }

    fn fill(mut self) {
        self.filled = true;
    }
}

impl<R> Drop for Vacancy<'_, R> {
    fn drop(&mut self) {
        if !self.filled && self.pool.try_add(Slot::Vacant).is_err() {
            debug!("Dropped an empty slot of a closed RabbitMq channel pool");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
