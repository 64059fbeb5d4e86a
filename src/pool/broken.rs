//! Sliding-window accounting of broken channels.
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Timestamps of the most recent broken channel returns, oldest first.
#[derive(Debug)]
pub struct BrokenEventLog {
    events: VecDeque<Instant>,
    capacity: usize,
}

impl BrokenEventLog {
    /// A log that never retains more than `capacity` events.
    ///
    /// Tolerance checks only ever look at the last `tolerance` events, so `capacity`
    /// should be at least the configured tolerance.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a channel breaking at the current instant.
    pub fn record_broken_now(&mut self) {
        self.record_broken_at(Instant::now());
    }

    pub(crate) fn record_broken_at(&mut self, at: Instant) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(at);
    }

    /// `true` when at least `tolerance` of the last `tolerance` broken events happened
    /// within the trailing `interval`.
    ///
    /// Events older than the last `tolerance` are discarded first.
    pub fn within_tolerance(&mut self, tolerance: u32, interval: Duration) -> bool {
        self.within_tolerance_at(Instant::now(), tolerance, interval)
    }

    pub(crate) fn within_tolerance_at(
        &mut self,
        now: Instant,
        tolerance: u32,
        interval: Duration,
    ) -> bool {
        let tolerance = tolerance as usize;
        while self.events.len() > tolerance {
            self.events.pop_front();
        }
        let recent = match now.checked_sub(interval) {
            Some(window_start) => self.events.iter().filter(|at| **at > window_start).count(),
            // The window reaches back past the clock's origin.
            None => self.events.len(),
        };
        recent >= tolerance
    }

    /// Number of broken events currently kept.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
