//! Live bandwidth estimation from single-row probe fetches.
//!
//! Every table layer fetch begins with a one-row probe; its observed payload
//! size divided by the elapsed wall time becomes the new estimate. The
//! estimator is deliberately a most-recent-sample overwrite, not a smoothed
//! average: viewport changes make old samples irrelevant quickly.

use std::time::Duration;

use serde_json::Value;

use crate::source::Row;

/// Floor for the divisor when estimating wait times, so an unmeasured (zero)
/// estimate yields a huge wait rather than a division by zero.
pub const MIN_BYTES_PER_SEC: f64 = 1e-9;

/// Floor for probe elapsed time; sub-millisecond local responses would
/// otherwise produce absurd estimates.
const MIN_SAMPLE_SECS: f64 = 0.001;

/// Most-recent-sample bandwidth estimate in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandwidthEstimate {
    bytes_per_sec: f64,
}

impl BandwidthEstimate {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn from_bytes_per_sec(bytes_per_sec: f64) -> Self {
        Self { bytes_per_sec }
    }

    /// Record a probe sample, overwriting the previous estimate.
    pub fn record_sample(&mut self, payload_bytes: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(MIN_SAMPLE_SECS);
        self.bytes_per_sec = payload_bytes as f64 / secs;
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    /// Estimated seconds to transfer `payload_bytes` at the current estimate.
    pub fn estimated_wait_secs(&self, payload_bytes: u64) -> f64 {
        payload_bytes as f64 / self.bytes_per_sec.max(MIN_BYTES_PER_SEC)
    }
}

/// Observed payload size of a probe row: the length of its serialized form.
pub fn payload_bytes(row: &Row) -> usize {
    serde_json::to_string(&Value::Object(row.clone()))
        .map(|s| s.len())
        .unwrap_or(0)
}
