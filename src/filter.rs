//! Declarative filter model and combinators.
//!
//! Filters are a closed tagged union so the resolver gets exhaustiveness
//! checking per source kind. The extent sub-filter is kept separable from the
//! rest: recomputing a data bounding box must not be biased by the box it is
//! trying to replace, and subscription fingerprints must survive panning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extent::Extent;

/// One hop of a join path from the layer's root table to the table holding
/// the geometry column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinStep {
    /// Target table of this hop.
    pub table: String,
    /// Column equalities joining the previous table to `table`.
    pub on: Vec<(String, String)>,
}

/// A compound filter over a named data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Logical AND. An empty list matches everything.
    And { filters: Vec<Filter> },
    /// Spatial intersection of a geometry column with a bounding box.
    /// This is the extent sub-filter and is stripped by [`Filter::without_extent`].
    BboxIntersects { column: String, bbox: [f64; 4] },
    /// Column equality.
    Equals { column: String, value: Value },
    /// An opaque source-native condition (pass-through).
    Raw { condition: Value },
    /// Filter applied through a join path (rows must have a joined row
    /// matching the inner filter).
    ExistsJoined { path: Vec<JoinStep>, filter: Box<Filter> },
}

impl Filter {
    /// Match-all filter.
    pub fn all() -> Self {
        Filter::And {
            filters: Vec::new(),
        }
    }

    /// Logical AND of the given filters, flattening nested ANDs.
    ///
    /// A single operand is returned as-is; an empty list matches everything.
    pub fn and(filters: Vec<Filter>) -> Self {
        let mut flat = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                Filter::And { filters: inner } => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Filter::And { filters: flat }
        }
    }

    /// Spatial filter for the current viewport, clamped to world bounds.
    pub fn extent(extent: &Extent, geometry_column: &str) -> Self {
        Filter::BboxIntersects {
            column: geometry_column.to_string(),
            bbox: extent.clamped_to_world().to_array(),
        }
    }

    /// Column equality filter.
    pub fn equals(column: impl Into<String>, value: Value) -> Self {
        Filter::Equals {
            column: column.into(),
            value,
        }
    }

    /// Wrap this filter in a join-path scope, if a path is present.
    pub fn wrapped_if_joined(self, path: Option<&[JoinStep]>) -> Self {
        match path {
            Some(steps) if !steps.is_empty() => Filter::ExistsJoined {
                path: steps.to_vec(),
                filter: Box::new(self),
            },
            _ => self,
        }
    }

    /// This filter with every extent sub-filter removed.
    ///
    /// Used for extent recomputation and for subscription fingerprints so
    /// panning does not churn subscriptions.
    pub fn without_extent(&self) -> Filter {
        match self {
            Filter::BboxIntersects { .. } => Filter::all(),
            Filter::And { filters } => Filter::and(
                filters
                    .iter()
                    .filter(|f| !matches!(f, Filter::BboxIntersects { .. }))
                    .map(|f| f.without_extent())
                    .collect(),
            ),
            Filter::ExistsJoined { path, filter } => Filter::ExistsJoined {
                path: path.clone(),
                filter: Box::new(filter.without_extent()),
            },
            other => other.clone(),
        }
    }

    /// Deterministic string fingerprint of this filter.
    ///
    /// serde_json's default map is ordered, so semantically identical filters
    /// produce identical strings. Non-finite floats cannot occur in validated
    /// filters; should serialization still fail the debug encoding is used,
    /// which is also deterministic.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Combine a base filter, per-layer external filters and an optional extent
/// filter into the final fetch filter.
pub fn combine_filters(
    base: Option<&Filter>,
    external: &[Filter],
    extent_filter: Option<Filter>,
) -> Filter {
    let mut parts = Vec::with_capacity(external.len() + 2);
    if let Some(base) = base {
        parts.push(base.clone());
    }
    parts.extend(external.iter().cloned());
    if let Some(extent_filter) = extent_filter {
        parts.push(extent_filter);
    }
    Filter::and(parts)
}
