//! One fetch cycle: resolve every enabled layer, consult the cache, probe,
//! decide raw vs aggregated, fetch, and build renderable features.
//!
//! Layers are fetched concurrently within a cycle. A per-layer failure lands
//! in that layer's result; it never aborts the cycle. The cycle carries the
//! fingerprint of the inputs it was started from so the orchestrator can
//! detect that the inputs moved on while it ran.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregation::{self, AggregationPolicy, ProbeOutcome};
use crate::bandwidth::{self, BandwidthEstimate};
use crate::cache::{CacheDecision, CachedLayer, SignatureCache};
use crate::config::{EngineOptions, RefreshMode};
use crate::engine::state;
use crate::error::LayerError;
use crate::extent::Viewport;
use crate::feature::{keys, Feature, Geometry};
use crate::filter::Filter;
use crate::layer::LayerQuery;
use crate::resolver::{self, FetchPlan, RawQueryPlan, TablePlan, GEOMETRY_COLUMN_PARAM};
use crate::signature::DataSignature;
use crate::simplify;
use crate::source::{FindOptions, Row, Selection, SourceRegistry};
use crate::subscription::DesiredSubscription;

/// Everything a cycle reads, captured at dispatch time.
#[derive(Debug, Clone)]
pub(crate) struct CycleInputs {
    pub layers: Vec<LayerQuery>,
    pub viewport: Viewport,
    pub global_filters: Vec<Filter>,
    pub options: EngineOptions,
    pub data_age: u64,
    pub fetch_row_limit: usize,
}

impl CycleInputs {
    pub fn fingerprint(&self) -> String {
        state::input_fingerprint(
            &self.layers,
            &self.viewport,
            &self.global_filters,
            &self.options,
            self.data_age,
        )
    }
}

/// How one layer came out of a cycle.
#[derive(Debug)]
pub(crate) enum LayerOutcome {
    /// A cached or freshly fetched result is ready to display.
    Ready(Arc<CachedLayer>),
    /// Another fetch in this cycle owns this signature. The orchestrator
    /// shares that fetch's stored result, or keeps whatever the layer showed
    /// before if the owner failed.
    KeepPrevious(DataSignature),
    Failed(LayerError),
}

#[derive(Debug)]
pub(crate) struct LayerResult {
    pub layer_id: String,
    pub outcome: LayerOutcome,
    pub warnings: Vec<LayerError>,
}

#[derive(Debug)]
pub(crate) struct CycleOutcome {
    /// Fingerprint of the inputs this cycle ran against.
    pub fingerprint: String,
    pub results: Vec<LayerResult>,
    /// Subscriptions the realtime refresh mode wants open after this cycle.
    pub desired_subscriptions: Vec<DesiredSubscription>,
}

pub(crate) async fn run_cycle(
    inputs: CycleInputs,
    cache: Arc<SignatureCache>,
    registry: Arc<SourceRegistry>,
    bandwidth: Arc<Mutex<BandwidthEstimate>>,
) -> CycleOutcome {
    let fingerprint = inputs.fingerprint();
    let fetches = inputs
        .layers
        .iter()
        .filter(|layer| layer.enabled())
        .map(|layer| fetch_layer(layer, &inputs, &cache, &registry, &bandwidth));
    let results = join_all(fetches).await;
    let desired_subscriptions = desired_subscriptions(&inputs, &registry);
    CycleOutcome {
        fingerprint,
        results,
        desired_subscriptions,
    }
}

async fn fetch_layer(
    layer: &LayerQuery,
    inputs: &CycleInputs,
    cache: &SignatureCache,
    registry: &SourceRegistry,
    bandwidth: &Mutex<BandwidthEstimate>,
) -> LayerResult {
    let plan = match resolver::resolve(
        layer,
        &inputs.viewport,
        &inputs.global_filters,
        registry,
        inputs.fetch_row_limit,
    ) {
        Ok(plan) => plan,
        Err(err) => return failed(layer.id().to_string(), err, Vec::new()),
    };
    match plan {
        FetchPlan::Table(plan) => {
            fetch_table(layer, plan, inputs, cache, registry, bandwidth).await
        }
        FetchPlan::RawQuery(plan) => fetch_raw_query(layer, plan, inputs, cache, registry).await,
        FetchPlan::External(plan) => fetch_external(layer, plan, inputs, cache, registry).await,
    }
}

async fn fetch_table(
    layer: &LayerQuery,
    plan: TablePlan,
    inputs: &CycleInputs,
    cache: &SignatureCache,
    registry: &SourceRegistry,
    bandwidth: &Mutex<BandwidthEstimate>,
) -> LayerResult {
    let layer_id = layer.id().to_string();
    let zoom = inputs.viewport.zoom;

    // The signature is the fetch request context; whether the fetch ends up
    // raw or aggregated is a function of that same context plus the data age,
    // so it does not need to be part of the key.
    let fetch_options = FindOptions {
        selection: Selection::GeometryWithId {
            column: plan.geometry_column.clone(),
            tolerance: normalized_tolerance(zoom),
            id_columns: plan.id_columns.clone(),
        },
        limit: Some(plan.limit),
    };
    let signature =
        DataSignature::for_table(&plan.filter, &fetch_options, inputs.data_age, &inputs.options);

    let reservation = match cache.lookup_or_begin(&signature) {
        CacheDecision::Cached(entry) => return ready(layer_id, entry, Vec::new()),
        CacheDecision::InFlight => {
            return LayerResult {
                layer_id,
                outcome: LayerOutcome::KeepPrevious(signature),
                warnings: Vec::new(),
            }
        }
        CacheDecision::Fetch(reservation) => reservation,
    };
    let Some(source) = registry.table(&plan.source_name) else {
        return failed(
            layer_id,
            LayerError::MissingCapability {
                source_name: plan.source_name.clone(),
                operation: "find",
            },
            Vec::new(),
        );
    };

    let mut warnings = Vec::new();

    // One-row probe: emptiness, geometry kind and a bandwidth sample in a
    // single cheap query.
    let probe_options = FindOptions {
        selection: Selection::Geometry {
            column: plan.geometry_column.clone(),
            tolerance: None,
        },
        limit: Some(1),
    };
    let started = Instant::now();
    let mut is_point = false;
    let mut probed = false;
    match source.find_one(&plan.filter, &probe_options).await {
        Ok(None) => {
            // Nothing in the viewport; cache the emptiness too.
            let entry = cache.complete(
                reservation,
                CachedLayer {
                    signature,
                    features: Arc::new(Vec::new()),
                },
            );
            return ready(layer_id, entry, warnings);
        }
        Ok(Some(row)) => {
            bandwidth
                .lock()
                .await
                .record_sample(bandwidth::payload_bytes(&row), started.elapsed());
            is_point = row_geometry(&row, &plan.geometry_column)
                .map(|g| g.kind.is_point())
                .unwrap_or(false);
            probed = true;
        }
        Err(err) => {
            warn!(layer = %layer_id, error = %err, "probe failed, fetching raw");
            warnings.push(LayerError::ProbeFailed(err.to_string()));
        }
    }

    // Only point layers aggregate, and only when the policy's probe says the
    // raw fetch would be too expensive. A failed probe falls back to raw.
    let mut aggregate = false;
    if probed && is_point {
        let estimate = *bandwidth.lock().await;
        let probe = match inputs.options.aggregation {
            AggregationPolicy::RowLimit { .. } => {
                source.count(&plan.filter).await.map(ProbeOutcome::Count)
            }
            AggregationPolicy::TimeBudget { .. } => {
                // Size only the geometry payload; id columns are not part of
                // the transfer estimate.
                let size_options = FindOptions {
                    selection: Selection::Geometry {
                        column: plan.geometry_column.clone(),
                        tolerance: None,
                    },
                    limit: Some(plan.limit),
                };
                source
                    .size(&plan.filter, &size_options)
                    .await
                    .map(ProbeOutcome::SizeBytes)
            }
        };
        match probe {
            Ok(outcome) => {
                aggregate =
                    aggregation::should_aggregate(&inputs.options.aggregation, &outcome, &estimate);
            }
            Err(err) => {
                warn!(layer = %layer_id, error = %err, "aggregation probe failed, fetching raw");
                warnings.push(LayerError::ProbeFailed(err.to_string()));
            }
        }
    }

    let fetched = if aggregate {
        let cell_size = aggregation::cluster_cell_size(&inputs.viewport.extent);
        debug!(layer = %layer_id, cell_size, "fetching aggregated clusters");
        let options = FindOptions {
            selection: Selection::Clusters {
                column: plan.geometry_column.clone(),
                cell_size,
            },
            limit: Some(plan.limit),
        };
        source
            .find(&plan.filter, &options)
            .await
            .map(|rows| cluster_features(rows, &plan, &layer_id, &inputs.viewport))
    } else {
        // Points are never simplified; drop the tolerance for them.
        let options = if is_point {
            FindOptions {
                selection: Selection::GeometryWithId {
                    column: plan.geometry_column.clone(),
                    tolerance: None,
                    id_columns: plan.id_columns.clone(),
                },
                limit: Some(plan.limit),
            }
        } else {
            fetch_options
        };
        source
            .find(&plan.filter, &options)
            .await
            .map(|rows| table_features(rows, &plan, &layer_id, zoom))
    };

    match fetched {
        Ok(features) => {
            let entry = cache.complete(
                reservation,
                CachedLayer {
                    signature,
                    features: Arc::new(features),
                },
            );
            ready(layer_id, entry, warnings)
        }
        // The reservation drops here, freeing the slot for a retry.
        Err(err) => failed(layer_id, LayerError::FetchFailed(err.to_string()), warnings),
    }
}

async fn fetch_raw_query(
    layer: &LayerQuery,
    plan: RawQueryPlan,
    inputs: &CycleInputs,
    cache: &SignatureCache,
    registry: &SourceRegistry,
) -> LayerResult {
    let layer_id = layer.id().to_string();
    let signature = DataSignature::for_raw_query(&plan.sql, &plan.params, inputs.data_age);

    let reservation = match cache.lookup_or_begin(&signature) {
        CacheDecision::Cached(entry) => return ready(layer_id, entry, Vec::new()),
        CacheDecision::InFlight => {
            return LayerResult {
                layer_id,
                outcome: LayerOutcome::KeepPrevious(signature),
                warnings: Vec::new(),
            }
        }
        CacheDecision::Fetch(reservation) => reservation,
    };
    let Some(source) = registry.raw_query_source() else {
        return failed(
            layer_id,
            LayerError::MissingCapability {
                source_name: "raw query executor".to_string(),
                operation: "raw_query",
            },
            Vec::new(),
        );
    };

    match source.raw_query(&plan.sql, &plan.params).await {
        Ok(rows) => {
            let geometry_column = plan
                .params
                .get(GEOMETRY_COLUMN_PARAM)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let features =
                raw_query_features(rows, &geometry_column, &layer_id, inputs.viewport.zoom);
            let entry = cache.complete(
                reservation,
                CachedLayer {
                    signature,
                    features: Arc::new(features),
                },
            );
            ready(layer_id, entry, Vec::new())
        }
        Err(err) => failed(
            layer_id,
            LayerError::FetchFailed(err.to_string()),
            Vec::new(),
        ),
    }
}

async fn fetch_external(
    layer: &LayerQuery,
    plan: crate::resolver::ExternalPlan,
    inputs: &CycleInputs,
    cache: &SignatureCache,
    registry: &SourceRegistry,
) -> LayerResult {
    let layer_id = layer.id().to_string();
    let signature = DataSignature::for_external(&plan.query, &plan.bbox, inputs.data_age);

    let reservation = match cache.lookup_or_begin(&signature) {
        CacheDecision::Cached(entry) => return ready(layer_id, entry, Vec::new()),
        CacheDecision::InFlight => {
            return LayerResult {
                layer_id,
                outcome: LayerOutcome::KeepPrevious(signature),
                warnings: Vec::new(),
            }
        }
        CacheDecision::Fetch(reservation) => reservation,
    };
    let Some(source) = registry.external_source() else {
        return failed(
            layer_id,
            LayerError::MissingCapability {
                source_name: "external feature service".to_string(),
                operation: "fetch_features",
            },
            Vec::new(),
        );
    };

    match source.fetch_features(&plan.query, &plan.bbox).await {
        Ok(mut features) => {
            features.retain(|f| f.geometry.has_coordinates());
            let radius = aggregation::point_radius(inputs.viewport.zoom);
            for feature in &mut features {
                feature
                    .properties
                    .insert(keys::LAYER_ID.into(), Value::String(layer_id.clone()));
                if feature.geometry.kind.is_point()
                    && !feature.properties.contains_key(keys::RADIUS)
                {
                    feature
                        .properties
                        .insert(keys::RADIUS.into(), Value::from(radius));
                }
            }
            let entry = cache.complete(
                reservation,
                CachedLayer {
                    signature,
                    features: Arc::new(features),
                },
            );
            ready(layer_id, entry, Vec::new())
        }
        Err(err) => failed(
            layer_id,
            LayerError::FetchFailed(err.to_string()),
            Vec::new(),
        ),
    }
}

/// The `(source, filter)` pairs realtime mode wants subscribed after this
/// cycle. Empty unless the refresh mode is realtime.
fn desired_subscriptions(
    inputs: &CycleInputs,
    registry: &SourceRegistry,
) -> Vec<DesiredSubscription> {
    let RefreshMode::Realtime { throttle_ms } = inputs.options.refresh else {
        return Vec::new();
    };
    let throttle = Duration::from_millis(throttle_ms);
    let mut desired = Vec::new();
    for layer in inputs.layers.iter().filter(|l| l.enabled()) {
        if !matches!(layer, LayerQuery::Table(_)) {
            continue;
        }
        let Ok(FetchPlan::Table(plan)) = resolver::resolve(
            layer,
            &inputs.viewport,
            &inputs.global_filters,
            registry,
            inputs.fetch_row_limit,
        ) else {
            continue;
        };
        desired.push(DesiredSubscription {
            source_name: plan.source_name,
            fingerprint: plan.filter_without_extent.fingerprint(),
            filter: plan.filter_without_extent,
            throttle,
        });
    }
    desired
}

/// Simplification tolerance for the zoom, with 0 normalized to `None`
/// (request unsimplified geometry).
fn normalized_tolerance(zoom: f64) -> Option<f64> {
    let tolerance = simplify::simplification_tolerance(zoom);
    (tolerance > 0.0).then_some(tolerance)
}

/// Parse the geometry column of a row, dropping empty geometries.
fn row_geometry(row: &Row, column: &str) -> Option<Geometry> {
    row.get(column)
        .cloned()
        .and_then(|value| serde_json::from_value::<Geometry>(value).ok())
        .filter(|geometry| geometry.has_coordinates())
}

/// Build features from unaggregated table rows.
fn table_features(rows: Vec<Row>, plan: &TablePlan, layer_id: &str, zoom: f64) -> Vec<Feature> {
    let radius = aggregation::point_radius(zoom);
    let mut features = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;
    for mut row in rows {
        let Some(geometry) = row_geometry(&row, &plan.geometry_column) else {
            dropped += 1;
            continue;
        };
        row.remove(&plan.geometry_column);
        let mut properties = row;
        if !plan.id_columns.is_empty() {
            let mut id = Map::new();
            for column in &plan.id_columns {
                if let Some(value) = properties.get(column) {
                    id.insert(column.clone(), value.clone());
                }
            }
            properties.insert(keys::ID.into(), Value::Object(id));
        }
        if geometry.kind.is_point() {
            properties.insert(keys::RADIUS.into(), Value::from(radius));
        }
        properties.insert(keys::LAYER_ID.into(), Value::String(layer_id.to_string()));
        properties.insert(keys::SOURCE.into(), Value::String(plan.source_name.clone()));
        properties.insert(
            keys::GEOMETRY_COLUMN.into(),
            Value::String(plan.geometry_column.clone()),
        );
        features.push(Feature::new(geometry, properties));
    }
    if dropped > 0 {
        debug!(layer = layer_id, dropped, "dropped rows without usable geometry");
    }
    features
}

/// Build features from grid-aggregated cluster rows.
fn cluster_features(
    rows: Vec<Row>,
    plan: &TablePlan,
    layer_id: &str,
    viewport: &Viewport,
) -> Vec<Feature> {
    let mut kept = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;
    for row in rows {
        let count = row.get(keys::COUNT).and_then(Value::as_u64);
        let geometry = row_geometry(&row, &plan.geometry_column);
        match (count, geometry) {
            (Some(count), Some(geometry)) => kept.push((count, geometry)),
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(layer = layer_id, dropped, "dropped malformed cluster rows");
    }

    let counts: Vec<u64> = kept.iter().map(|(count, _)| *count).collect();
    let radii = aggregation::cluster_radii(&counts, &viewport.extent);
    kept.into_iter()
        .zip(radii)
        .map(|((count, geometry), radius)| {
            let mut properties = Map::new();
            properties.insert(keys::COUNT.into(), Value::from(count));
            properties.insert(keys::RADIUS.into(), Value::from(radius));
            properties.insert(keys::LAYER_ID.into(), Value::String(layer_id.to_string()));
            properties.insert(keys::SOURCE.into(), Value::String(plan.source_name.clone()));
            properties.insert(
                keys::GEOMETRY_COLUMN.into(),
                Value::String(plan.geometry_column.clone()),
            );
            Feature::new(geometry, properties)
        })
        .collect()
}

/// Build features from raw-query rows. Row hashes travel through as ordinary
/// columns for hover detail retrieval.
fn raw_query_features(
    rows: Vec<Row>,
    geometry_column: &str,
    layer_id: &str,
    zoom: f64,
) -> Vec<Feature> {
    let radius = aggregation::point_radius(zoom);
    let mut features = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;
    for mut row in rows {
        let Some(geometry) = row_geometry(&row, geometry_column) else {
            dropped += 1;
            continue;
        };
        row.remove(geometry_column);
        let mut properties = row;
        if geometry.kind.is_point() {
            properties.insert(keys::RADIUS.into(), Value::from(radius));
        }
        properties.insert(keys::LAYER_ID.into(), Value::String(layer_id.to_string()));
        properties.insert(
            keys::GEOMETRY_COLUMN.into(),
            Value::String(geometry_column.to_string()),
        );
        features.push(Feature::new(geometry, properties));
    }
    if dropped > 0 {
        debug!(layer = layer_id, dropped, "dropped rows without usable geometry");
    }
    features
}

fn ready(layer_id: String, entry: Arc<CachedLayer>, warnings: Vec<LayerError>) -> LayerResult {
    LayerResult {
        layer_id,
        outcome: LayerOutcome::Ready(entry),
        warnings,
    }
}

fn failed(layer_id: String, error: LayerError, warnings: Vec<LayerError>) -> LayerResult {
    LayerResult {
        layer_id,
        outcome: LayerOutcome::Failed(error),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;
    use serde_json::json;

    fn plan() -> TablePlan {
        TablePlan {
            source_name: "places".into(),
            geometry_column: "geom".into(),
            id_columns: vec!["id".into()],
            tooltip_columns: None,
            filter: Filter::all(),
            filter_without_extent: Filter::all(),
            limit: 1000,
        }
    }

    fn point_row(id: u64) -> Row {
        let mut row = Row::new();
        row.insert(
            "geom".into(),
            json!({"type": "Point", "coordinates": [id as f64, 0.0]}),
        );
        row.insert("id".into(), json!(id));
        row
    }

    #[test]
    fn test_table_features_carry_identity_and_radius() {
        let features = table_features(vec![point_row(7)], &plan(), "l1", 12.0);
        assert_eq!(features.len(), 1);
        let feature = &features[0];
        assert_eq!(feature.row_id(), Some(&json!({"id": 7})));
        assert_eq!(feature.layer_id(), Some("l1"));
        assert!(feature.properties.contains_key(keys::RADIUS));
        // Geometry column does not leak into properties.
        assert!(!feature.properties.contains_key("geom"));
    }

    #[test]
    fn test_rows_without_geometry_are_dropped() {
        let mut bad = Row::new();
        bad.insert("id".into(), json!(1));
        let features = table_features(vec![bad, point_row(2)], &plan(), "l1", 12.0);
        assert_eq!(features.len(), 1);
    }

    #[test]
    fn test_cluster_features_get_batch_scaled_radii() {
        let viewport = Viewport {
            extent: Extent::new(0.0, 0.0, 0.05, 0.05).unwrap(),
            zoom: 10.0,
        };
        let mut small = point_row(1);
        small.insert(keys::COUNT.into(), json!(1));
        let mut big = point_row(2);
        big.insert(keys::COUNT.into(), json!(100));

        let features = cluster_features(vec![small, big], &plan(), "l1", &viewport);
        assert_eq!(features.len(), 2);
        let r1 = features[0].properties[keys::RADIUS].as_f64().unwrap();
        let r2 = features[1].properties[keys::RADIUS].as_f64().unwrap();
        assert!(r1 < r2);
        assert_eq!(features[0].cluster_count(), Some(1));
        assert_eq!(features[1].cluster_count(), Some(100));
    }

    #[test]
    fn test_cluster_rows_without_count_are_dropped() {
        let viewport = Viewport {
            extent: Extent::new(0.0, 0.0, 1.0, 1.0).unwrap(),
            zoom: 5.0,
        };
        let features = cluster_features(vec![point_row(1)], &plan(), "l1", &viewport);
        assert!(features.is_empty());
    }

    #[test]
    fn test_high_zoom_requests_no_tolerance() {
        assert_eq!(normalized_tolerance(9.0), None);
        assert_eq!(normalized_tolerance(15.0), None);
        assert!(normalized_tolerance(3.0).is_some());
    }
}
