//! Error types for the engine.
//!
//! Per-layer failures are isolated to the failing layer's slot in engine
//! state; only structural errors (invalid extent) surface at the top level.

use thiserror::Error;

/// Errors scoped to a single layer.
///
/// These never abort the containing fetch cycle: the failing layer shows an
/// error state while other layers render normally.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayerError {
    /// The configured source does not expose an operation the layer needs.
    #[error("source `{source_name}` does not support `{operation}`")]
    MissingCapability {
        source_name: String,
        operation: &'static str,
    },

    /// A count/size probe failed. The layer falls back to unaggregated
    /// fetching; this is a warning, not a failure.
    #[error("count/size probe failed: {0}")]
    ProbeFailed(String),

    /// The layer's main fetch failed.
    #[error("layer fetch failed: {0}")]
    FetchFailed(String),

    /// Opening a realtime subscription failed. The layer degrades to
    /// manual/interval refresh.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
}

/// Engine-level (structural) errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// A degenerate or non-finite bounding box was supplied.
    #[error("invalid extent [{min_x}, {min_y}, {max_x}, {max_y}]")]
    InvalidExtent {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    },

    /// One or more layers cannot report a data extent, so "zoom to data"
    /// reports unavailable rather than a wrong partial box.
    #[error("data extent unavailable")]
    ExtentUnavailable,
}
