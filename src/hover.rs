//! Debounced, staleness-guarded hover detail resolution.
//!
//! Per pointer session the resolver moves Idle -> Candidate -> (debounce)
//! -> Resolving -> Resolved, collapsing back to Idle on pointer-leave. A new
//! hover target before the debounce fires resets the timer (never
//! accumulates). A result is applied only if the recorded identity still
//! matches the feature that triggered the fetch; superseded results are
//! discarded silently.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::LayerError;
use crate::feature::Feature;
use crate::filter::Filter;
use crate::layer::LayerQuery;
use crate::source::{FindOptions, Selection, SourceRegistry};

/// Hover detail visible to the host.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HoverDetail {
    /// Nothing hovered, or the last resolution produced nothing.
    #[default]
    None,
    /// A candidate is recorded and its detail fetch is debouncing/resolving.
    Pending,
    /// Full detail for the hovered feature (a row object, or `{"count": n}`
    /// for aggregated clusters).
    Resolved(Value),
}

/// Snapshot of the hover session for the engine state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HoverSnapshot {
    /// Serialized identity of the hovered feature, if any.
    pub identity: Option<String>,
    pub detail: HoverDetail,
}

/// Owns the hover session state and its debounce timer.
pub struct HoverResolver {
    debounce: Duration,
    identity: Option<String>,
    detail: HoverDetail,
    timer: Option<CancellationToken>,
}

impl HoverResolver {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            identity: None,
            detail: HoverDetail::None,
            timer: None,
        }
    }

    pub fn snapshot(&self) -> HoverSnapshot {
        HoverSnapshot {
            identity: self.identity.clone(),
            detail: self.detail.clone(),
        }
    }

    /// Pointer left the surface: cancel any pending timer and reset to Idle.
    pub fn clear(&mut self) {
        self.cancel_timer();
        self.identity = None;
        self.detail = HoverDetail::None;
    }

    /// Pointer moved onto a feature. Starts (or restarts) the debounce timer
    /// and spawns the detail fetch once it fires. Re-hovering the identity
    /// that is already resolving/resolved is ignored.
    pub fn on_hover<F>(
        &mut self,
        feature: Feature,
        layer: Option<LayerQuery>,
        registry: Arc<SourceRegistry>,
        on_resolved: F,
    ) where
        F: FnOnce(String, Result<Value, LayerError>) + Send + 'static,
    {
        let identity = feature.identity();
        if self.identity.as_deref() == Some(identity.as_str())
            && self.detail != HoverDetail::None
        {
            trace!("hover target unchanged, ignoring");
            return;
        }

        // Timer reset, not accumulation.
        self.cancel_timer();
        self.identity = Some(identity.clone());
        self.detail = HoverDetail::Pending;

        let token = CancellationToken::new();
        self.timer = Some(token.clone());
        let debounce = self.debounce;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            let result = resolve_detail(&feature, layer.as_ref(), &registry).await;
            on_resolved(identity, result);
        });
    }

    /// Apply a resolution result if the session still targets the identity
    /// that triggered the fetch. Returns whether the result was applied.
    pub fn apply_result(&mut self, identity: &str, result: Result<Value, LayerError>) -> bool {
        if self.identity.as_deref() != Some(identity) {
            trace!("discarding stale hover result");
            return false;
        }
        self.detail = match result {
            Ok(Value::Null) => HoverDetail::None,
            Ok(value) => HoverDetail::Resolved(value),
            Err(err) => {
                debug!(error = %err, "hover detail fetch failed");
                HoverDetail::None
            }
        };
        true
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl Drop for HoverResolver {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Fetch full detail for a hovered feature.
///
/// Aggregated clusters are answered from the count without a fetch; table
/// rows are fetched by id-equality; raw-query rows go through the source's
/// row-by-hash retrieval.
async fn resolve_detail(
    feature: &Feature,
    layer: Option<&LayerQuery>,
    registry: &SourceRegistry,
) -> Result<Value, LayerError> {
    if let Some(count) = feature.cluster_count() {
        return Ok(json!({ "count": count }));
    }

    match layer {
        Some(LayerQuery::Table(table)) => {
            let Some(Value::Object(id)) = feature.row_id() else {
                return Ok(Value::Null);
            };
            let source = registry.table(&table.source_name).ok_or_else(|| {
                LayerError::MissingCapability {
                    source_name: table.source_name.clone(),
                    operation: "find_one",
                }
            })?;
            let filter = Filter::and(
                id.iter()
                    .map(|(column, value)| Filter::equals(column.clone(), value.clone()))
                    .collect(),
            );
            let options = FindOptions {
                selection: Selection::Detail {
                    columns: table.tooltip_columns.clone(),
                },
                limit: Some(1),
            };
            let row = source
                .find_one(&filter, &options)
                .await
                .map_err(|err| LayerError::FetchFailed(err.to_string()))?;
            Ok(row.map(Value::Object).unwrap_or(Value::Null))
        }
        Some(LayerQuery::RawQuery(raw)) => {
            let Some(hash) = feature.row_hash() else {
                return Ok(Value::Null);
            };
            let source = registry.raw_query_source().ok_or_else(|| {
                LayerError::MissingCapability {
                    source_name: "raw query executor".to_string(),
                    operation: "row_by_hash",
                }
            })?;
            let row = source
                .row_by_hash(&raw.sql, &raw.params, hash)
                .await
                .map_err(|err| LayerError::FetchFailed(err.to_string()))?;
            Ok(row.map(Value::Object).unwrap_or(Value::Null))
        }
        _ => Ok(Value::Null),
    }
}
