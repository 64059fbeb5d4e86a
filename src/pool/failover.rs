//! Which broker new channels are created against, and when to switch.
use crate::amqp::configuration::{ConnectionParameters, FailoverSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverPhase {
    /// Channels are created against the configured primary.
    Normal,
    /// Channels are created against the standby.
    FailedOver,
}

/// Error returned when the endpoints could not be switched.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FailoverError {
    #[error("no standby RabbitMq endpoint is configured")]
    NoStandby,
    #[error("RabbitMq channels are not failed over, there is nothing to fail back from")]
    NotFailedOver,
}

/// Thresholds driving failover and failback decisions.
#[derive(Debug, Clone, Copy)]
pub struct FailoverPolicy {
    pub tolerance: u32,
    pub tolerance_interval: Duration,
    pub failback_threshold: u32,
}

impl From<&FailoverSettings> for FailoverPolicy {
    fn from(settings: &FailoverSettings) -> Self {
        Self {
            tolerance: settings.tolerance,
            tolerance_interval: settings.tolerance_interval(),
            failback_threshold: settings.failback_threshold,
        }
    }
}

/// The failover state machine.
///
/// It owns the current (primary, standby) pair. Without a standby, every transition
/// fails with [`FailoverError::NoStandby`] and the primary never changes.
#[derive(Debug)]
pub struct FailoverState {
    primary: Arc<ConnectionParameters>,
    standby: Option<Arc<ConnectionParameters>>,
    /// The primary as configured, health checked before failing back.
    original: Arc<ConnectionParameters>,
    policy: Option<FailoverPolicy>,
    currently_failed_over: bool,
    failback_counter: u32,
}

impl FailoverState {
    /// A state machine that can switch between `primary` and `standby`.
    pub fn new(
        primary: ConnectionParameters,
        standby: ConnectionParameters,
        policy: FailoverPolicy,
    ) -> Self {
        let primary = Arc::new(primary);
        Self {
            original: Arc::clone(&primary),
            primary,
            standby: Some(Arc::new(standby)),
            policy: Some(policy),
            currently_failed_over: false,
            failback_counter: 0,
        }
    }

    /// An inert state machine that always points to `primary`.
    pub fn without_standby(primary: ConnectionParameters) -> Self {
        let primary = Arc::new(primary);
        Self {
            original: Arc::clone(&primary),
            primary,
            standby: None,
            policy: None,
            currently_failed_over: false,
            failback_counter: 0,
        }
    }

    /// Whether a standby is configured.
    pub fn is_enabled(&self) -> bool {
        self.standby.is_some()
    }

    /// Tolerance and failback thresholds, if failover is enabled.
    pub fn policy(&self) -> Option<FailoverPolicy> {
        self.policy
    }

    /// The endpoint new channels must be created against.
    pub fn current_primary(&self) -> &Arc<ConnectionParameters> {
        &self.primary
    }

    /// The endpoint a failover would switch to.
    pub fn current_standby(&self) -> Option<&Arc<ConnectionParameters>> {
        self.standby.as_ref()
    }

    /// The primary the state was built with, whatever the current phase.
    pub fn original_primary(&self) -> &Arc<ConnectionParameters> {
        &self.original
    }

    pub fn phase(&self) -> FailoverPhase {
        if self.currently_failed_over {
            FailoverPhase::FailedOver
        } else {
            FailoverPhase::Normal
        }
    }

    pub fn is_failed_over(&self) -> bool {
        self.currently_failed_over
    }

    /// Returns counted since the last failback check.
    pub fn failback_counter(&self) -> u32 {
        self.failback_counter
    }

    /// Swap primary and standby.
    ///
    /// Two consecutive calls cancel each other out, restoring both the original
    /// endpoints and the original phase.
    pub fn trigger_failover(&mut self, reason: &str) -> Result<FailoverPhase, FailoverError> {
        self.swap()?;
        self.currently_failed_over = !self.currently_failed_over;
        if reason == "failover" {
            warn!(host = %self.primary.host, "RabbitMq failed over to the standby host");
        } else {
            warn!(host = %self.primary.host, reason, "RabbitMq failed over to the standby host");
        }
        Ok(self.phase())
    }

    /// Swap back to the original primary and reset the failback counter.
    pub fn trigger_failback(&mut self) -> Result<FailoverPhase, FailoverError> {
        if !self.currently_failed_over {
            return Err(FailoverError::NotFailedOver);
        }
        self.swap()?;
        self.currently_failed_over = false;
        self.failback_counter = 0;
        warn!(host = %self.primary.host, "RabbitMq failed back to the original host");
        Ok(self.phase())
    }

    /// Count one channel return towards the next failback attempt.
    ///
    /// Returns the endpoint to health check when the failback threshold is reached. The
    /// counter starts over at that point, so the next check happens after another
    /// `failback_threshold` returns.
    pub fn record_return(&mut self) -> Option<Arc<ConnectionParameters>> {
        let policy = self.policy?;
        if !self.currently_failed_over {
            return None;
        }
        self.failback_counter = self.failback_counter.saturating_add(1);
        debug!(
            failback_counter = self.failback_counter,
            failback_threshold = policy.failback_threshold,
            "Counted a channel return while failed over"
        );
        if self.failback_counter < policy.failback_threshold {
            return None;
        }
        self.failback_counter = 0;
        Some(Arc::clone(&self.original))
    }

    fn swap(&mut self) -> Result<(), FailoverError> {
        let standby = self.standby.as_mut().ok_or(FailoverError::NoStandby)?;
        debug!(current = %self.primary.host, next = %standby.host, "Swapping RabbitMq endpoints");
        std::mem::swap(&mut self.primary, standby);
        Ok(())
    }
}
