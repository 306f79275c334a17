//! Source capability traits and the source registry.
//!
//! The engine never talks to a database or network directly: every named data
//! source is injected behind [`DataSource`] (find/count/size/extent and an
//! optional subscribe capability), raw-query execution behind
//! [`RawQuerySource`], and remote feature services behind
//! [`ExternalFeatureSource`]. Errors are typed; absence of an optional
//! capability degrades the requesting layer only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::extent::Extent;
use crate::feature::Feature;
use crate::filter::Filter;

/// Boxed future returned by source capability methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A row returned by a source: flat column name to JSON value.
pub type Row = Map<String, Value>;

/// Callback invoked by a subscription when matching data changes.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Errors reported by source capabilities.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    /// The query itself failed (syntax, permissions, connectivity).
    #[error("source query failed: {0}")]
    Query(String),

    /// The source does not implement the requested operation.
    #[error("operation `{0}` is not supported by this source")]
    Unsupported(&'static str),

    /// The source is temporarily unreachable.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// What columns a fetch should return.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "select", rename_all = "snake_case")]
pub enum Selection {
    /// Geometry only, optionally simplified. Used by probes.
    Geometry {
        column: String,
        tolerance: Option<f64>,
    },
    /// Geometry plus a structured row identity. The main fetch shape.
    GeometryWithId {
        column: String,
        tolerance: Option<f64>,
        id_columns: Vec<String>,
    },
    /// Grid-aggregated clusters: one row per occupied cell carrying the cell
    /// count and the grid-snapped geometry.
    Clusters { column: String, cell_size: f64 },
    /// Full row detail for hover/click. `None` selects all columns.
    Detail { columns: Option<Vec<String>> },
}

/// Options accompanying a find/find_one/size call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FindOptions {
    pub selection: Selection,
    pub limit: Option<usize>,
}

/// Options for opening a change subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Row limit for the subscription's internal query; notification is all
    /// that matters, not payload.
    pub row_limit: usize,
    /// Minimum interval between change notifications.
    pub throttle: Duration,
}

/// Handle to an open change subscription.
///
/// Cancellation is idempotent; implementations watch the token and tear down
/// their watch when it fires.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Cancel the subscription. Safe to call more than once.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Capability interface for a named, table-like data source.
pub trait DataSource: Send + Sync {
    /// Source name as referenced by table-backed layers.
    fn name(&self) -> &str;

    /// Fetch rows matching a filter.
    fn find<'a>(
        &'a self,
        filter: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxFuture<'a, Result<Vec<Row>, SourceError>>;

    /// Fetch at most one row matching a filter.
    fn find_one<'a>(
        &'a self,
        filter: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxFuture<'a, Result<Option<Row>, SourceError>>;

    /// Count rows matching a filter.
    fn count<'a>(&'a self, filter: &'a Filter) -> BoxFuture<'a, Result<u64, SourceError>>;

    /// Estimated payload size in bytes of the rows a find would return.
    fn size<'a>(
        &'a self,
        filter: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxFuture<'a, Result<u64, SourceError>>;

    /// Spatial extent of the geometry column over matching rows, or `None`
    /// when no rows match.
    fn extent<'a>(
        &'a self,
        filter: &'a Filter,
        geometry_column: &'a str,
    ) -> BoxFuture<'a, Result<Option<Extent>, SourceError>>;

    /// Whether this source can open change subscriptions. Absence disables
    /// realtime mode for layers on this source, nothing else.
    fn supports_subscribe(&self) -> bool {
        false
    }

    /// Open a change subscription. `on_change` is invoked (throttled) when
    /// rows matching the filter change.
    fn subscribe<'a>(
        &'a self,
        filter: &'a Filter,
        options: &'a SubscribeOptions,
        on_change: ChangeCallback,
    ) -> BoxFuture<'a, Result<SubscriptionHandle, SourceError>> {
        let _ = (filter, options, on_change);
        Box::pin(async { Err(SourceError::Unsupported("subscribe")) })
    }
}

/// Capability interface for executing opaque raw queries.
pub trait RawQuerySource: Send + Sync {
    /// Execute a raw query with bound parameters.
    fn raw_query<'a>(
        &'a self,
        query: &'a str,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<Vec<Row>, SourceError>>;

    /// Spatial extent of the geometry produced by a raw query.
    fn query_extent<'a>(
        &'a self,
        query: &'a str,
        params: &'a Value,
    ) -> BoxFuture<'a, Result<Option<Extent>, SourceError>>;

    /// Retrieve a single row of a raw query by its opaque row hash, for hover
    /// detail.
    fn row_by_hash<'a>(
        &'a self,
        query: &'a str,
        params: &'a Value,
        row_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<Row>, SourceError>>;
}

/// Capability interface for remote feature services (e.g. an OSM Overpass
/// endpoint). Produces features directly; no local aggregation applies.
pub trait ExternalFeatureSource: Send + Sync {
    /// Fetch features for a query descriptor within a bounding box.
    fn fetch_features<'a>(
        &'a self,
        query: &'a str,
        bbox: &'a Extent,
    ) -> BoxFuture<'a, Result<Vec<Feature>, SourceError>>;
}

/// Injected set of source capabilities, looked up by the resolver and the
/// fetch cycle.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    tables: HashMap<String, Arc<dyn DataSource>>,
    raw: Option<Arc<dyn RawQuerySource>>,
    external: Option<Arc<dyn ExternalFeatureSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table-like source under its own name.
    pub fn register_table(&mut self, source: Arc<dyn DataSource>) {
        self.tables.insert(source.name().to_string(), source);
    }

    pub fn set_raw_query_source(&mut self, source: Arc<dyn RawQuerySource>) {
        self.raw = Some(source);
    }

    pub fn set_external_source(&mut self, source: Arc<dyn ExternalFeatureSource>) {
        self.external = Some(source);
    }

    pub fn table(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.tables.get(name).cloned()
    }

    pub fn raw_query_source(&self) -> Option<Arc<dyn RawQuerySource>> {
        self.raw.clone()
    }

    pub fn external_source(&self) -> Option<Arc<dyn ExternalFeatureSource>> {
        self.external.clone()
    }
}
