//! Zoom-dependent geometry simplification policy.
//!
//! Non-point geometries are requested pre-simplified with a tolerance chosen
//! from a two-segment zoom curve: coarse at low zoom, tending to zero at high
//! zoom. Tolerance 0 means "request unsimplified geometry". Point geometries
//! are never simplified; callers check the probe row's geometry kind first.

use crate::scale::LinearScale;

/// Zoom level where the curve switches segments.
pub const ZOOM_BREAKPOINT: f64 = 7.0;

/// Simplification tolerance for non-point geometries at a zoom level.
///
/// Monotonically non-increasing in zoom: higher zoom never gets a coarser
/// tolerance than lower zoom.
pub fn simplification_tolerance(zoom: f64) -> f64 {
    if zoom > ZOOM_BREAKPOINT {
        LinearScale::new([9.0, ZOOM_BREAKPOINT], [0.0, 0.005])
            .clamped()
            .apply(zoom)
    } else {
        LinearScale::new([ZOOM_BREAKPOINT, 1.0], [0.005, 0.05])
            .clamped()
            .apply(zoom)
    }
}
