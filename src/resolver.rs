//! Layer query resolution: declarative layer + viewport -> concrete fetch plan.
//!
//! Pure transformation; failures propagate to the orchestrator as per-layer
//! errors and never abort the whole engine. The table plan keeps the filter
//! with and without the extent sub-filter separate: the former drives the
//! actual fetch, the latter drives extent recomputation and subscription
//! fingerprints.

use serde_json::{Map, Value};

use crate::error::LayerError;
use crate::extent::{Extent, Viewport};
use crate::filter::{combine_filters, Filter};
use crate::layer::{ExternalLayer, LayerQuery, RawQueryLayer, TableLayer};
use crate::source::SourceRegistry;

/// Parameter name under which the layer's geometry column is bound for raw
/// queries.
pub const GEOMETRY_COLUMN_PARAM: &str = "geometry_column";

/// Resolved plan for a table-backed layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePlan {
    pub source_name: String,
    pub geometry_column: String,
    pub id_columns: Vec<String>,
    pub tooltip_columns: Option<Vec<String>>,
    /// Extent filter AND everything else; used for the actual fetch.
    pub filter: Filter,
    /// The same filter with the extent sub-filter excluded; used for extent
    /// recomputation and subscription fingerprints.
    pub filter_without_extent: Filter,
    pub limit: usize,
}

/// Resolved plan for a raw-query-backed layer: the inner query wrapped in a
/// bounded outer SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct RawQueryPlan {
    pub sql: String,
    pub params: Value,
    pub limit: usize,
}

/// Resolved plan for an external-source-backed layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalPlan {
    pub query: String,
    pub bbox: Extent,
}

/// A concrete fetch plan, created fresh per fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchPlan {
    Table(TablePlan),
    RawQuery(RawQueryPlan),
    External(ExternalPlan),
}

/// Resolve one layer against the current viewport and global external
/// filters.
///
/// # Errors
///
/// [`LayerError::MissingCapability`] when the registry has no source exposing
/// the operations the layer kind requires.
pub fn resolve(
    layer: &LayerQuery,
    viewport: &Viewport,
    global_filters: &[Filter],
    registry: &SourceRegistry,
    limit: usize,
) -> Result<FetchPlan, LayerError> {
    match layer {
        LayerQuery::Table(table) => resolve_table(table, viewport, global_filters, registry, limit),
        LayerQuery::RawQuery(raw) => resolve_raw_query(raw, registry, limit),
        LayerQuery::External(external) => resolve_external(external, viewport, registry),
    }
}

fn resolve_table(
    layer: &TableLayer,
    viewport: &Viewport,
    global_filters: &[Filter],
    registry: &SourceRegistry,
    limit: usize,
) -> Result<FetchPlan, LayerError> {
    if registry.table(&layer.source_name).is_none() {
        return Err(LayerError::MissingCapability {
            source_name: layer.source_name.clone(),
            operation: "find",
        });
    }

    // Layer-local filters may live behind a join path; global filters and the
    // extent filter always apply to the geometry table directly.
    let local = combine_filters(
        layer.base_filter.as_ref(),
        &layer.external_filters,
        None,
    )
    .wrapped_if_joined(layer.join_path.as_deref());

    let mut parts = vec![local];
    parts.extend(global_filters.iter().cloned());
    let filter_without_extent = Filter::and(parts);

    let extent_filter = Filter::extent(&viewport.extent, &layer.common.geometry_column);
    let filter = Filter::and(vec![filter_without_extent.clone(), extent_filter]);

    Ok(FetchPlan::Table(TablePlan {
        source_name: layer.source_name.clone(),
        geometry_column: layer.common.geometry_column.clone(),
        id_columns: layer.id_columns.clone(),
        tooltip_columns: layer.tooltip_columns.clone(),
        filter,
        filter_without_extent,
        limit,
    }))
}

fn resolve_raw_query(
    layer: &RawQueryLayer,
    registry: &SourceRegistry,
    limit: usize,
) -> Result<FetchPlan, LayerError> {
    if registry.raw_query_source().is_none() {
        return Err(LayerError::MissingCapability {
            source_name: "raw query executor".to_string(),
            operation: "raw_query",
        });
    }

    let sql = wrap_raw_query(&layer.sql, layer.with_statement.as_deref(), limit);
    let params = bind_geometry_column(&layer.params, &layer.common.geometry_column);

    Ok(FetchPlan::RawQuery(RawQueryPlan { sql, params, limit }))
}

fn resolve_external(
    layer: &ExternalLayer,
    viewport: &Viewport,
    registry: &SourceRegistry,
) -> Result<FetchPlan, LayerError> {
    if registry.external_source().is_none() {
        return Err(LayerError::MissingCapability {
            source_name: "external feature service".to_string(),
            operation: "fetch_features",
        });
    }

    Ok(FetchPlan::External(ExternalPlan {
        query: layer.query.clone(),
        bbox: viewport.extent.clamped_to_world(),
    }))
}

/// Wrap an opaque query as an inner subquery with a bounded outer SELECT.
pub fn wrap_raw_query(sql: &str, with_statement: Option<&str>, limit: usize) -> String {
    let with = with_statement.unwrap_or("");
    format!(
        "{with}\nSELECT *\nFROM (\n{sql}\n) layer_data\nLIMIT {limit}"
    )
}

/// Merge the geometry-column binding into the layer's bound parameters.
fn bind_geometry_column(params: &Value, geometry_column: &str) -> Value {
    let mut object = match params {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("params".to_string(), other.clone());
            map
        }
    };
    object.insert(
        GEOMETRY_COLUMN_PARAM.to_string(),
        Value::String(geometry_column.to_string()),
    );
    Value::Object(object)
}
