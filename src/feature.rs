//! GeoJSON-style features produced by the engine.
//!
//! The engine hands the rendering surface flat feature collections; every
//! row-derived value lands in `properties` under the keys in [`keys`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known property keys set by the engine.
pub mod keys {
    /// Visual radius in pixels (points and clusters).
    pub const RADIUS: &str = "radius";
    /// Cluster row count (aggregated features only).
    pub const COUNT: &str = "count";
    /// Structured row identity (table-backed features).
    pub const ID: &str = "id";
    /// Opaque row hash (raw-query-backed features).
    pub const ROW_HASH: &str = "row_hash";
    /// Owning layer id.
    pub const LAYER_ID: &str = "layer_id";
    /// Source table name (table-backed features).
    pub const SOURCE: &str = "source";
    /// Geometry column the feature came from.
    pub const GEOMETRY_COLUMN: &str = "geometry_column";
}

/// GeoJSON geometry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
}

impl GeometryKind {
    /// Point-like geometries are candidates for aggregation and are never
    /// simplified.
    pub fn is_point(&self) -> bool {
        matches!(self, GeometryKind::Point | GeometryKind::MultiPoint)
    }
}

/// A GeoJSON geometry. Coordinates are kept as raw JSON since the engine
/// never interprets them; only the kind matters for policy decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: GeometryKind,
    pub coordinates: Value,
}

impl Geometry {
    /// Whether the geometry carries any coordinates at all. Aggregate rows
    /// snapped outside the grid can come back empty and are dropped.
    pub fn has_coordinates(&self) -> bool {
        match &self.coordinates {
            Value::Array(values) => !values.is_empty(),
            _ => false,
        }
    }
}

/// A renderable feature: geometry plus flat properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: Geometry, properties: Map<String, Value>) -> Self {
        Self {
            geometry,
            properties,
        }
    }

    /// Serialized identity used for hover/click deduplication and staleness
    /// guards. Two features with identical content have identical identity.
    pub fn identity(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }

    /// Cluster row count, if this is an aggregated feature.
    pub fn cluster_count(&self) -> Option<u64> {
        self.properties.get(keys::COUNT).and_then(Value::as_u64)
    }

    /// Structured row id, if present.
    pub fn row_id(&self) -> Option<&Value> {
        self.properties.get(keys::ID)
    }

    /// Opaque row hash, if present (raw-query-backed features).
    pub fn row_hash(&self) -> Option<&str> {
        self.properties.get(keys::ROW_HASH).and_then(Value::as_str)
    }

    /// Id of the layer this feature belongs to.
    pub fn layer_id(&self) -> Option<&str> {
        self.properties.get(keys::LAYER_ID).and_then(Value::as_str)
    }
}
