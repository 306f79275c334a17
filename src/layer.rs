//! Declarative layer queries.
//!
//! A layer is one visual data series on the map, backed by exactly one of: a
//! named table-like source, an opaque raw query, or a remote feature service.
//! The closed enum gives the resolver exhaustiveness checking per source kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::filter::{Filter, JoinStep};

/// Styling handles carried through to the rendering surface untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStyle {
    /// RGBA fill/line color.
    pub color: [u8; 4],
    /// Optional extrusion height.
    pub elevation: Option<f64>,
}

impl Default for LayerStyle {
    fn default() -> Self {
        Self {
            color: [0, 129, 167, 255],
            elevation: None,
        }
    }
}

/// Fields common to every layer kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCommon {
    /// Unique within the active layer set and stable across re-renders as
    /// long as the declarative layer is unchanged.
    pub id: String,
    /// Identifier of the owning link/window configuration.
    pub link_id: String,
    /// Geometry column to render (positional placeholder for raw queries).
    pub geometry_column: String,
    pub style: LayerStyle,
    pub disabled: bool,
}

/// A layer reading rows from a named table-like source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayer {
    pub common: LayerCommon,
    pub source_name: String,
    /// Columns forming the stable row identity.
    pub id_columns: Vec<String>,
    /// Filter configured on the layer itself.
    pub base_filter: Option<Filter>,
    /// Filters pushed in from outside (linked rows, cross-filters).
    pub external_filters: Vec<Filter>,
    /// Join path when the geometry lives on a related table.
    pub join_path: Option<Vec<JoinStep>>,
    /// Columns fetched for hover detail; `None` selects all columns.
    pub tooltip_columns: Option<Vec<String>>,
}

/// A layer rendering the output of an opaque raw query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQueryLayer {
    pub common: LayerCommon,
    /// The inner query text. The geometry column is referenced through a
    /// named placeholder bound via `params`.
    pub sql: String,
    /// Optional leading WITH statement prepended to the wrapped query.
    pub with_statement: Option<String>,
    /// Bound parameters.
    pub params: Value,
}

/// A layer backed by a remote feature service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLayer {
    pub common: LayerCommon,
    /// Service-specific query descriptor.
    pub query: String,
}

/// One visual data series, discriminated by source kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerQuery {
    Table(TableLayer),
    RawQuery(RawQueryLayer),
    External(ExternalLayer),
}

impl LayerQuery {
    pub fn common(&self) -> &LayerCommon {
        match self {
            LayerQuery::Table(layer) => &layer.common,
            LayerQuery::RawQuery(layer) => &layer.common,
            LayerQuery::External(layer) => &layer.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn enabled(&self) -> bool {
        !self.common().disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn common(id: &str) -> LayerCommon {
        LayerCommon {
            id: id.to_string(),
            link_id: "link-1".to_string(),
            geometry_column: "geom".to_string(),
            style: LayerStyle::default(),
            disabled: false,
        }
    }

    #[test]
    fn test_common_accessors() {
        let layer = LayerQuery::External(ExternalLayer {
            common: common("l1"),
            query: "node[amenity=cafe]".to_string(),
        });
        assert_eq!(layer.id(), "l1");
        assert!(layer.enabled());
    }

    #[test]
    fn test_serde_tagging() {
        let layer = LayerQuery::RawQuery(RawQueryLayer {
            common: common("l2"),
            sql: "SELECT geom FROM places".to_string(),
            with_statement: None,
            params: json!({}),
        });
        let value = serde_json::to_value(&layer).unwrap();
        assert_eq!(value["type"], "raw_query");
        let decoded: LayerQuery = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, layer);
    }
}
