//! Published engine state.
//!
//! The engine exposes its state as an immutable [`EngineSnapshot`] through a
//! watch channel; the rendering surface only ever sees whole snapshots, never
//! partial mutations.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineOptions;
use crate::error::LayerError;
use crate::extent::Viewport;
use crate::feature::Feature;
use crate::filter::Filter;
use crate::hover::HoverSnapshot;
use crate::layer::{LayerQuery, LayerStyle};
use crate::signature::DataSignature;

/// Per-layer render state: the features last produced for the layer plus any
/// error/warning attached to the most recent cycle that touched it.
#[derive(Debug, Clone, Default)]
pub struct LayerSlot {
    pub layer_id: String,
    /// Signature of the cached result currently on display.
    pub signature: Option<DataSignature>,
    pub features: Arc<Vec<Feature>>,
    pub style: LayerStyle,
    /// Set when the layer's last fetch failed; the other layers render
    /// normally.
    pub error: Option<LayerError>,
    /// Non-fatal degradations (failed probes) from the last cycle.
    pub warnings: Vec<LayerError>,
}

/// Immutable view of the whole engine, published after every state change.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    /// One slot per declared layer, in declaration order. Disabled layers get
    /// an empty slot.
    pub layers: Vec<LayerSlot>,
    pub viewport: Option<Viewport>,
    pub hover: HoverSnapshot,
    /// Identity of the last clicked feature, if any.
    pub clicked: Option<String>,
    /// Whether a fetch cycle is currently in flight.
    pub loading: bool,
    /// Monotonic refresh counter; bumped by forced refresh, interval ticks
    /// and subscription notifications.
    pub data_age: u64,
    /// Engine-level warnings (failed subscription opens).
    pub warnings: Vec<LayerError>,
}

/// Deterministic fingerprint of everything that feeds a fetch cycle.
///
/// A finished cycle is applied only if its input fingerprint still matches
/// the engine's current inputs; otherwise the result is stale and discarded.
pub(crate) fn input_fingerprint(
    layers: &[LayerQuery],
    viewport: &Viewport,
    global_filters: &[Filter],
    options: &EngineOptions,
    data_age: u64,
) -> String {
    #[derive(Serialize, Debug)]
    struct Parts<'a> {
        layers: &'a [LayerQuery],
        viewport: &'a Viewport,
        global_filters: &'a [Filter],
        options: &'a EngineOptions,
        data_age: u64,
    }
    let parts = Parts {
        layers,
        viewport,
        global_filters,
        options,
        data_age,
    };
    encode(&parts)
}

fn encode<T: Serialize + fmt::Debug>(parts: &T) -> String {
    serde_json::to_string(parts).unwrap_or_else(|_| format!("{parts:?}"))
}
