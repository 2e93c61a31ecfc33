//! Update rate control for telemetry subscriptions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery rate requested by a telemetry subscriber
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every snapshot the decoder accepts
    Native,

    /// At most this many snapshots per second, latest wins.
    /// A rate at or above the decoder's own limit behaves like `Native`.
    Max(u32),
}

impl UpdateRate {
    /// Resolve the requested rate against the decoder's accepted interval.
    pub fn normalize(self, min_interval: Duration) -> Self {
        match self {
            UpdateRate::Native => UpdateRate::Native,
            UpdateRate::Max(0) => UpdateRate::Native,
            UpdateRate::Max(hz) if Duration::from_secs_f64(1.0 / hz as f64) <= min_interval => {
                UpdateRate::Native
            }
            UpdateRate::Max(hz) => UpdateRate::Max(hz),
        }
    }

    /// Spacing between deliveries, or `None` when no throttling is needed.
    pub fn throttle_interval(self, min_interval: Duration) -> Option<Duration> {
        match self.normalize(min_interval) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}
