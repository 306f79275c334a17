//! Engine configuration: construction-time tunables and runtime options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::AggregationPolicy;

/// Row limit applied to every layer fetch, aggregated or not.
pub const DEFAULT_FETCH_ROW_LIMIT: usize = 100_000;

/// Debounce interval before a hovered feature's detail is fetched.
pub const DEFAULT_HOVER_DEBOUNCE: Duration = Duration::from_millis(300);

/// Row limit for subscription-internal queries; only the notification
/// matters, not the payload.
pub const DEFAULT_SUBSCRIPTION_ROW_LIMIT: usize = 2;

/// Zoom assumed when an extent is computed from data rather than reported by
/// the host viewport.
pub const DEFAULT_ZOOM: f64 = 1.0;

/// Construction-time engine tunables. These do not change at runtime; see
/// [`EngineOptions`] for the runtime-switchable policies.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fetch_row_limit: usize,
    pub hover_debounce: Duration,
    pub default_zoom: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_row_limit: DEFAULT_FETCH_ROW_LIMIT,
            hover_debounce: DEFAULT_HOVER_DEBOUNCE,
            default_zoom: DEFAULT_ZOOM,
        }
    }
}

/// How layer data is kept fresh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RefreshMode {
    /// Data refreshes only on viewport/layer/filter changes or forced
    /// refresh.
    Static,
    /// The engine bumps the data age on a fixed interval.
    Interval { every_secs: u64 },
    /// Table-backed layers open change subscriptions; notifications bump the
    /// data age, throttled per subscription.
    Realtime { throttle_ms: u64 },
}

impl Default for RefreshMode {
    fn default() -> Self {
        RefreshMode::Static
    }
}

/// Runtime-switchable, engine-wide policies.
///
/// The aggregation policy is deliberately engine-wide rather than per-layer;
/// it mirrors a per-deployment configuration switch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    pub aggregation: AggregationPolicy,
    pub refresh: RefreshMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.fetch_row_limit, 100_000);
        assert_eq!(config.hover_debounce, Duration::from_millis(300));

        let options = EngineOptions::default();
        assert_eq!(options.refresh, RefreshMode::Static);
    }

    #[test]
    fn test_refresh_mode_serde() {
        let mode = RefreshMode::Realtime { throttle_ms: 5000 };
        let value = serde_json::to_value(mode).unwrap();
        assert_eq!(value["type"], "realtime");
        assert_eq!(value["throttle_ms"], 5000);
    }
}
