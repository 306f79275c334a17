//! Geographic extents (2D bounding boxes) and the viewport model.
//!
//! All extents are `[min_x, min_y, max_x, max_y]` in EPSG:4326 degrees.
//! Renderer-reported extents can overflow the projection bounds, so filters
//! derived from them are clamped to the world box first.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Western/southern/eastern/northern limits of the shared reference frame.
pub const WORLD_MIN_X: f64 = -180.0;
pub const WORLD_MIN_Y: f64 = -90.0;
pub const WORLD_MAX_X: f64 = 180.0;
pub const WORLD_MAX_Y: f64 = 90.0;

/// A 2D bounding box in the shared geographic reference frame.
///
/// Invariant: `min_x <= max_x` and `min_y <= max_y`. Construct through
/// [`Extent::new`] or validate with [`Extent::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    /// Create a validated extent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidExtent`] for degenerate boxes
    /// (`min > max`) or non-finite coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self, EngineError> {
        let extent = Self {
            min_x,
            min_y,
            max_x,
            max_y,
        };
        extent.validate()?;
        Ok(extent)
    }

    /// The whole world box.
    pub fn world() -> Self {
        Self {
            min_x: WORLD_MIN_X,
            min_y: WORLD_MIN_Y,
            max_x: WORLD_MAX_X,
            max_y: WORLD_MAX_Y,
        }
    }

    /// Check the extent invariant.
    pub fn validate(&self) -> Result<(), EngineError> {
        let finite = [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.min_x > self.max_x || self.min_y > self.max_y {
            return Err(EngineError::InvalidExtent {
                min_x: self.min_x,
                min_y: self.min_y,
                max_x: self.max_x,
                max_y: self.max_y,
            });
        }
        Ok(())
    }

    /// Clamp the extent to the world bounds.
    ///
    /// Renderer values can go over the projection limits during fast pans.
    pub fn clamped_to_world(&self) -> Self {
        Self {
            min_x: self.min_x.max(WORLD_MIN_X).min(WORLD_MAX_X),
            min_y: self.min_y.max(WORLD_MIN_Y).min(WORLD_MAX_Y),
            max_x: self.max_x.min(WORLD_MAX_X).max(WORLD_MIN_X),
            max_y: self.max_y.min(WORLD_MAX_Y).max(WORLD_MIN_Y),
        }
    }

    /// Union of two extents.
    pub fn merged(&self, other: &Extent) -> Self {
        Self {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn width(&self) -> f64 {
        (self.max_x - self.min_x).abs()
    }

    pub fn height(&self) -> f64 {
        (self.max_y - self.min_y).abs()
    }

    /// The smaller of the two dimensions, used by the aggregation grid and
    /// cluster radius curves.
    pub fn min_delta(&self) -> f64 {
        self.width().min(self.height())
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    /// Build a validated extent from `[min_x, min_y, max_x, max_y]`.
    pub fn from_array(values: [f64; 4]) -> Result<Self, EngineError> {
        Self::new(values[0], values[1], values[2], values[3])
    }
}

/// The host-reported visible region plus zoom level.
///
/// Zoom drives geometry simplification and point radius selection; the extent
/// drives filtering and the aggregation grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub extent: Extent,
    pub zoom: f64,
}
