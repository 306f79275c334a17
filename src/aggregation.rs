//! Adaptive aggregation: raw rows vs grid-snapped clusters.
//!
//! Applies to point-geometry table layers only. A cheap probe (row count or
//! estimated payload size) decides whether the layer is fetched as individual
//! rows or as grid-aggregated `(count, snapped geometry)` clusters. A failed
//! probe falls back to the raw branch; it never aborts the layer.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bandwidth::BandwidthEstimate;
use crate::extent::Extent;
use crate::scale::LinearScale;

/// Default row count above which point layers aggregate.
pub const DEFAULT_ROW_LIMIT: u64 = 1000;

/// Default time budget in seconds for the time-budget policy.
pub const DEFAULT_MAX_WAIT_SECS: f64 = 2.0;

/// Engine-wide policy choosing between raw rows and aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Aggregate when the matching row count exceeds `limit`.
    RowLimit { limit: u64 },
    /// Aggregate when the estimated transfer time exceeds `max_wait_secs`.
    TimeBudget { max_wait_secs: f64 },
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        AggregationPolicy::TimeBudget {
            max_wait_secs: DEFAULT_MAX_WAIT_SECS,
        }
    }
}

/// Result of the policy's probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// Row count (row-count policy).
    Count(u64),
    /// Estimated payload bytes (time-budget policy).
    SizeBytes(u64),
}

/// Decide whether to aggregate given the probe outcome.
pub fn should_aggregate(
    policy: &AggregationPolicy,
    probe: &ProbeOutcome,
    bandwidth: &BandwidthEstimate,
) -> bool {
    match (policy, probe) {
        (AggregationPolicy::RowLimit { limit }, ProbeOutcome::Count(count)) => count > limit,
        (AggregationPolicy::TimeBudget { max_wait_secs }, ProbeOutcome::SizeBytes(bytes)) => {
            let wait = bandwidth.estimated_wait_secs(*bytes);
            debug!(
                estimated_wait_secs = wait,
                max_wait_secs, "aggregation time-budget check"
            );
            wait > *max_wait_secs
        }
        // Mismatched probe kind: err on the raw branch.
        _ => false,
    }
}

/// Grid cell size for cluster aggregation, derived from the extent's smaller
/// dimension. The scale is intentionally unclamped: the shipped curve keeps
/// shrinking cells as the viewport tightens.
pub fn cluster_cell_size(extent: &Extent) -> f64 {
    LinearScale::new([0.886, 0.007166], [0.07, 0.0005]).apply(extent.min_delta())
}

/// Visual radii for a batch of cluster counts.
///
/// Each radius is linearly rescaled between 1 px and an extent-dependent
/// maximum (20-250 px) based on the count's position in the batch's observed
/// [min, max] count range.
pub fn cluster_radii(counts: &[u64], extent: &Extent) -> Vec<f64> {
    if counts.is_empty() {
        return Vec::new();
    }
    let min_count = counts.iter().copied().min().unwrap_or(0) as f64;
    let max_count = counts.iter().copied().max().unwrap_or(0) as f64;
    let max_radius = LinearScale::new([0.001, 0.1], [20.0, 250.0]).apply(extent.min_delta());
    let radius_scale = LinearScale::new([min_count, max_count], [1.0, max_radius]);
    counts
        .iter()
        .map(|count| radius_scale.apply(*count as f64))
        .collect()
}

/// Radius for individual (non-aggregated) point rows at a zoom level.
pub fn point_radius(zoom: f64) -> f64 {
    LinearScale::piecewise(&[20.0, 14.0, 10.0, 1.0], &[1.0, 10.0, 80.0, 100.0])
        .clamped()
        .apply(zoom)
}
