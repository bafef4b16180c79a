//! Per-device arrival filtering.
//!
//! Bands repeat the same advertisement many times per second. The arrival filter
//! lets at most one event per device through each suppression window, which keeps
//! the collector from being flooded with duplicate readings.

use crate::advertisement::SourceId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Minimum time between two accepted events from the same device.
pub const SUPPRESSION_WINDOW: Duration = Duration::from_secs(1);

/// Rate limiter keyed by source address.
///
/// Each device is tracked independently. The first event for a device is always
/// accepted, and only accepted events move that device's window forward.
#[derive(Debug)]
pub struct ArrivalFilter {
    /// Minimum time between accepted events for each device
    window: Duration,
    /// Last accepted arrival per device
    last_accepted: HashMap<SourceId, Instant>,
}

impl Default for ArrivalFilter {
    fn default() -> Self {
        Self::new(SUPPRESSION_WINDOW)
    }
}

impl ArrivalFilter {
    /// Create a filter with the given suppression window.
    ///
    /// # Example
    /// ```
    /// use std::time::{Duration, Instant};
    /// use heartband_relay::advertisement::SourceId;
    /// use heartband_relay::filter::ArrivalFilter;
    ///
    /// let mut filter = ArrivalFilter::new(Duration::from_secs(1));
    /// let source = SourceId::from("AA:BB:CC:DD:EE:FF");
    /// let now = Instant::now();
    /// assert!(filter.accept(&source, now));
    /// assert!(!filter.accept(&source, now + Duration::from_millis(300)));
    /// ```
    pub fn new(window: Duration) -> Self {
        ArrivalFilter {
            window,
            last_accepted: HashMap::new(),
        }
    }

    /// Decide whether an event from `source` arriving at `now` may proceed.
    ///
    /// Returns `true` if no event from this device has been accepted yet, or if at
    /// least one window has elapsed since the last accepted one. Acceptance records
    /// `now` as the device's new reference point; rejections leave it untouched.
    pub fn accept(&mut self, source: &SourceId, now: Instant) -> bool {
        match self.last_accepted.get(source) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                self.last_accepted.insert(source.clone(), now);
                true
            }
        }
    }

    /// Number of devices with a recorded arrival.
    pub fn tracked_sources(&self) -> usize {
        self.last_accepted.len()
    }
}
