//! Price-follow escape timer.
//!
//! The coordinator's escape task calls `record_escape` while the price
//! sits outside the corridor in the profit direction; once the escape has
//! persisted past `follow_timeout` the grid re-centers on the live price.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::GridConfig;

#[derive(Debug)]
pub struct PriceFollowManager {
    timeout: Duration,
    escape_since: Option<Instant>,
    trigger_count: u64,
}

impl PriceFollowManager {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.follow_timeout),
            escape_since: None,
            trigger_count: 0,
        }
    }

    /// Note an in-progress escape; returns how long it has lasted
    pub fn record_escape(&mut self) -> Duration {
        let since = *self.escape_since.get_or_insert_with(Instant::now);
        since.elapsed()
    }

    pub fn is_escaping(&self) -> bool {
        self.escape_since.is_some()
    }

    pub fn escape_duration(&self) -> Option<Duration> {
        self.escape_since.map(|since| since.elapsed())
    }

    pub fn timed_out(&self) -> bool {
        self.escape_duration()
            .map(|d| d >= self.timeout)
            .unwrap_or(false)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn mark_triggered(&mut self) {
        self.trigger_count += 1;
        self.escape_since = None;
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }

    /// Price back inside the corridor: forget the escape
    pub fn clear(&mut self) {
        self.escape_since = None;
    }
}
