//! Live subscription management for realtime layers.
//!
//! Holds at most one change subscription per distinct
//! `(source name, filter fingerprint)` pair, where the fingerprint excludes
//! the extent sub-filter so panning does not churn subscriptions. Reconciled
//! against the desired set after every engine cycle; a subscription failure
//! degrades the layer to manual refresh with a warning, never crashes the
//! engine.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LayerError;
use crate::filter::Filter;
use crate::source::{ChangeCallback, SourceRegistry, SubscribeOptions, SubscriptionHandle};

/// A `(source, filter)` pair some enabled realtime layer currently requires.
#[derive(Debug, Clone)]
pub struct DesiredSubscription {
    pub source_name: String,
    /// Fingerprint of `filter` (without the extent sub-filter); the dedup key
    /// together with `source_name`.
    pub fingerprint: String,
    pub filter: Filter,
    pub throttle: Duration,
}

struct ActiveSubscription {
    source_name: String,
    fingerprint: String,
    handle: SubscriptionHandle,
}

/// Owns every open change subscription for one engine instance.
pub struct SubscriptionManager {
    active: Vec<ActiveSubscription>,
    subscription_row_limit: usize,
}

impl SubscriptionManager {
    pub fn new(subscription_row_limit: usize) -> Self {
        Self {
            active: Vec::new(),
            subscription_row_limit,
        }
    }

    /// Bring the open subscriptions in line with the desired set.
    ///
    /// Entries no longer desired are cancelled and removed; desired pairs
    /// without an entry are opened. Returns warnings for pairs that failed to
    /// open.
    pub async fn reconcile(
        &mut self,
        desired: &[DesiredSubscription],
        registry: &SourceRegistry,
        on_change: ChangeCallback,
    ) -> Vec<LayerError> {
        // Tear down what is no longer needed.
        self.active.retain(|entry| {
            let still_wanted = desired.iter().any(|d| {
                d.source_name == entry.source_name && d.fingerprint == entry.fingerprint
            });
            if !still_wanted {
                debug!(
                    source = %entry.source_name,
                    "cancelling unused subscription"
                );
                entry.handle.cancel();
            }
            still_wanted
        });

        let mut warnings = Vec::new();
        for wanted in desired {
            if self.contains(&wanted.source_name, &wanted.fingerprint) {
                continue;
            }
            let Some(source) = registry.table(&wanted.source_name) else {
                warnings.push(LayerError::SubscriptionFailed(format!(
                    "unknown source `{}`",
                    wanted.source_name
                )));
                continue;
            };
            if !source.supports_subscribe() {
                // Absence of the capability disables realtime for this layer
                // only; no warning.
                debug!(source = %wanted.source_name, "source has no subscribe capability");
                continue;
            }
            let options = SubscribeOptions {
                row_limit: self.subscription_row_limit,
                throttle: wanted.throttle,
            };
            match source
                .subscribe(&wanted.filter, &options, on_change.clone())
                .await
            {
                Ok(handle) => {
                    debug!(
                        source = %wanted.source_name,
                        throttle_ms = wanted.throttle.as_millis() as u64,
                        "subscription opened"
                    );
                    self.active.push(ActiveSubscription {
                        source_name: wanted.source_name.clone(),
                        fingerprint: wanted.fingerprint.clone(),
                        handle,
                    });
                }
                Err(err) => {
                    warn!(source = %wanted.source_name, error = %err, "subscription failed");
                    warnings.push(LayerError::SubscriptionFailed(err.to_string()));
                }
            }
        }
        warnings
    }

    pub fn contains(&self, source_name: &str, fingerprint: &str) -> bool {
        self.active
            .iter()
            .any(|e| e.source_name == source_name && e.fingerprint == fingerprint)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Cancel every open subscription. Called on engine disposal; leaking a
    /// subscription would let stale callbacks mutate state for a layer that
    /// is no longer displayed.
    pub fn shutdown(&mut self) {
        for entry in self.active.drain(..) {
            entry.handle.cancel();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
