//! World extent aggregation across active layers ("zoom to data").
//!
//! Every enabled layer contributes a source-specific extent query computed
//! over its filter *without* the current extent sub-filter; the per-layer
//! boxes merge into a running min/max. The aggregation is all-or-nothing: if
//! any layer yields no rows, fails, or sits on a source that cannot report an
//! extent, the whole operation reports unavailable. A partial extent is worse
//! than no automatic zoom.

use tracing::debug;

use crate::error::{EngineError, LayerError};
use crate::extent::{Extent, Viewport};
use crate::filter::Filter;
use crate::layer::LayerQuery;
use crate::resolver::{self, FetchPlan};
use crate::source::SourceRegistry;

/// Compute the merged data extent of all enabled layers.
///
/// # Errors
///
/// [`EngineError::ExtentUnavailable`] when there is nothing to zoom to: no
/// enabled layers, an external-source layer present, an empty layer, or a
/// failed extent query.
pub async fn aggregate_data_extent(
    layers: &[LayerQuery],
    global_filters: &[Filter],
    registry: &SourceRegistry,
    limit: usize,
) -> Result<Extent, EngineError> {
    // Resolution needs some viewport; the extent part is discarded because
    // extent queries run on the filter without it.
    let probe_viewport = Viewport {
        extent: Extent::world(),
        zoom: 1.0,
    };

    let mut merged: Option<Extent> = None;
    for layer in layers.iter().filter(|l| l.enabled()) {
        let extent = layer_extent(layer, &probe_viewport, global_filters, registry, limit).await?;
        merged = Some(match merged {
            Some(current) => current.merged(&extent),
            None => extent,
        });
    }
    merged.ok_or(EngineError::ExtentUnavailable)
}

async fn layer_extent(
    layer: &LayerQuery,
    viewport: &Viewport,
    global_filters: &[Filter],
    registry: &SourceRegistry,
    limit: usize,
) -> Result<Extent, EngineError> {
    let plan = resolver::resolve(layer, viewport, global_filters, registry, limit)
        .map_err(|err| unavailable(layer, &err.to_string()))?;

    let extent = match plan {
        FetchPlan::Table(plan) => {
            let source = registry
                .table(&plan.source_name)
                .ok_or(EngineError::ExtentUnavailable)?;
            source
                .extent(&plan.filter_without_extent, &plan.geometry_column)
                .await
                .map_err(|err| {
                    unavailable(layer, &LayerError::FetchFailed(err.to_string()).to_string())
                })?
        }
        FetchPlan::RawQuery(plan) => {
            let source = registry
                .raw_query_source()
                .ok_or(EngineError::ExtentUnavailable)?;
            source
                .query_extent(&plan.sql, &plan.params)
                .await
                .map_err(|err| {
                    unavailable(layer, &LayerError::FetchFailed(err.to_string()).to_string())
                })?
        }
        // Remote feature services cannot report a data extent; the whole
        // aggregation short-circuits.
        FetchPlan::External(_) => {
            debug!(layer = layer.id(), "external layer has no data extent");
            None
        }
    };

    extent.ok_or(EngineError::ExtentUnavailable)
}

fn unavailable(layer: &LayerQuery, reason: &str) -> EngineError {
    debug!(layer = layer.id(), reason, "layer extent unavailable");
    EngineError::ExtentUnavailable
}
