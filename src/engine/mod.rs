//! The map engine orchestrator.
//!
//! [`MapEngine`] owns all engine state and runs as a single task processing
//! commands from an [`EngineHandle`]. Fetch cycles run as spawned tasks, one
//! at a time: triggers arriving while a cycle is in flight coalesce into a
//! single follow-up cycle, and a finished cycle whose inputs no longer match
//! the current state is discarded. State is published as immutable
//! [`EngineSnapshot`]s through a watch channel; discrete happenings (zoom to
//! data) go out on a broadcast channel.

mod cycle;
mod state;

pub use state::{EngineSnapshot, LayerSlot};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bandwidth::BandwidthEstimate;
use crate::cache::SignatureCache;
use crate::config::{EngineConfig, EngineOptions, RefreshMode, DEFAULT_SUBSCRIPTION_ROW_LIMIT};
use crate::data_extent;
use crate::error::{EngineError, LayerError};
use crate::extent::{Extent, Viewport};
use crate::feature::Feature;
use crate::filter::Filter;
use crate::hover::HoverResolver;
use crate::layer::LayerQuery;
use crate::signature::DataSignature;
use crate::source::{ChangeCallback, SourceRegistry};
use crate::subscription::SubscriptionManager;

use cycle::{CycleInputs, CycleOutcome, LayerOutcome, LayerResult};

/// Discrete engine happenings, broadcast to any number of listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A new snapshot was published on the watch channel.
    SnapshotUpdated,
    /// Zoom-to-data finished and the viewport was moved to the merged extent.
    ZoomedToData(Extent),
    /// Zoom-to-data could not determine an extent; the viewport is unchanged.
    DataExtentUnavailable,
}

enum EngineCommand {
    SetLayers(Vec<LayerQuery>),
    SetViewport(Viewport),
    SetGlobalFilters(Vec<Filter>),
    SetOptions(EngineOptions),
    Refresh,
    ZoomToData,
    Hover(Box<Feature>),
    HoverEnd,
    Click(Option<Box<Feature>>),
    CycleFinished(Box<CycleOutcome>),
    ExtentComputed(Result<Extent, EngineError>),
    HoverResolved {
        identity: String,
        result: Result<Value, LayerError>,
    },
}

/// Cheap, cloneable handle for driving a running [`MapEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl EngineHandle {
    /// Replace the declarative layer set.
    pub fn set_layers(&self, layers: Vec<LayerQuery>) {
        let _ = self.tx.send(EngineCommand::SetLayers(layers));
    }

    /// Report a new viewport.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidExtent`] for degenerate or non-finite extents;
    /// the engine state is untouched.
    pub fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError> {
        viewport.extent.validate()?;
        let _ = self.tx.send(EngineCommand::SetViewport(viewport));
        Ok(())
    }

    /// Replace the global external filters applied to every table layer.
    pub fn set_global_filters(&self, filters: Vec<Filter>) {
        let _ = self.tx.send(EngineCommand::SetGlobalFilters(filters));
    }

    /// Switch the runtime policies (aggregation, refresh mode).
    pub fn set_options(&self, options: EngineOptions) {
        let _ = self.tx.send(EngineCommand::SetOptions(options));
    }

    /// Force a refetch of every layer, bypassing cached results.
    pub fn refresh(&self) {
        let _ = self.tx.send(EngineCommand::Refresh);
    }

    /// Move the viewport to the merged data extent of all enabled layers.
    pub fn zoom_to_data(&self) {
        let _ = self.tx.send(EngineCommand::ZoomToData);
    }

    /// Report the pointer resting on a feature.
    pub fn hover(&self, feature: Feature) {
        let _ = self.tx.send(EngineCommand::Hover(Box::new(feature)));
    }

    /// Report the pointer leaving the map surface.
    pub fn hover_end(&self) {
        let _ = self.tx.send(EngineCommand::HoverEnd);
    }

    /// Report a click on a feature (or on empty space with `None`).
    pub fn click(&self, feature: Option<Feature>) {
        let _ = self.tx.send(EngineCommand::Click(feature.map(Box::new)));
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch receiver delivering every published snapshot.
    pub fn watch_snapshots(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stop the engine task, cancelling open subscriptions and timers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// The engine task. Construct with [`MapEngine::new`] and drive it with
/// `tokio::spawn(engine.run())`.
pub struct MapEngine {
    config: EngineConfig,
    registry: Arc<SourceRegistry>,
    cache: Arc<SignatureCache>,
    bandwidth: Arc<Mutex<BandwidthEstimate>>,
    subscriptions: SubscriptionManager,
    hover: HoverResolver,

    layers: Vec<LayerQuery>,
    viewport: Option<Viewport>,
    global_filters: Vec<Filter>,
    options: EngineOptions,
    data_age: u64,
    slots: HashMap<String, LayerSlot>,
    subscription_warnings: Vec<LayerError>,
    clicked: Option<String>,
    loading: bool,
    cycle_running: bool,
    load_again: bool,
    computing_extent: bool,

    rx: Option<mpsc::UnboundedReceiver<EngineCommand>>,
    tx: mpsc::UnboundedSender<EngineCommand>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl MapEngine {
    pub fn new(config: EngineConfig, registry: SourceRegistry) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::default());
        let (events, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let hover = HoverResolver::new(config.hover_debounce);

        let engine = Self {
            config,
            registry: Arc::new(registry),
            cache: Arc::new(SignatureCache::new()),
            bandwidth: Arc::new(Mutex::new(BandwidthEstimate::new())),
            subscriptions: SubscriptionManager::new(DEFAULT_SUBSCRIPTION_ROW_LIMIT),
            hover,
            layers: Vec::new(),
            viewport: None,
            global_filters: Vec::new(),
            options: EngineOptions::default(),
            data_age: 0,
            slots: HashMap::new(),
            subscription_warnings: Vec::new(),
            clicked: None,
            loading: false,
            cycle_running: false,
            load_again: false,
            computing_extent: false,
            rx: Some(rx),
            tx: tx.clone(),
            snapshot_tx,
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let handle = EngineHandle {
            tx,
            snapshot_rx,
            events,
            cancel,
        };
        (engine, handle)
    }

    /// Run the engine until shut down.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut ticker_mode = self.options.refresh;
        let mut ticker = build_ticker(ticker_mode);
        self.publish();

        loop {
            if self.options.refresh != ticker_mode {
                ticker_mode = self.options.refresh;
                ticker = build_ticker(ticker_mode);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                _ = tick_or_never(&mut ticker) => {
                    debug!("interval refresh");
                    self.data_age += 1;
                    self.request_cycle();
                }
            }
        }
        self.subscriptions.shutdown();
        self.hover.clear();
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetLayers(layers) => {
                let ids: HashSet<String> = layers.iter().map(|l| l.id().to_string()).collect();
                self.slots.retain(|id, _| ids.contains(id));
                self.layers = layers;
                self.request_cycle();
            }
            EngineCommand::SetViewport(viewport) => {
                self.viewport = Some(viewport);
                self.request_cycle();
            }
            EngineCommand::SetGlobalFilters(filters) => {
                self.global_filters = filters;
                self.request_cycle();
            }
            EngineCommand::SetOptions(options) => {
                self.options = options;
                self.request_cycle();
            }
            EngineCommand::Refresh => {
                self.data_age += 1;
                self.request_cycle();
            }
            EngineCommand::ZoomToData => self.start_zoom_to_data(),
            EngineCommand::Hover(feature) => self.start_hover(*feature),
            EngineCommand::HoverEnd => {
                self.hover.clear();
                self.publish();
            }
            EngineCommand::Click(feature) => {
                self.clicked = feature.map(|f| f.identity());
                self.publish();
            }
            EngineCommand::CycleFinished(outcome) => self.finish_cycle(*outcome).await,
            EngineCommand::ExtentComputed(result) => self.finish_zoom_to_data(result),
            EngineCommand::HoverResolved { identity, result } => {
                if self.hover.apply_result(&identity, result) {
                    self.publish();
                }
            }
        }
    }

    /// Trigger a fetch cycle, coalescing with an in-flight one.
    fn request_cycle(&mut self) {
        if self.cycle_running {
            self.load_again = true;
            return;
        }
        self.start_cycle();
    }

    fn start_cycle(&mut self) {
        let Some(viewport) = self.viewport else {
            // No viewport reported yet; nothing to fetch.
            self.publish();
            return;
        };
        let inputs = CycleInputs {
            layers: self.layers.clone(),
            viewport,
            global_filters: self.global_filters.clone(),
            options: self.options,
            data_age: self.data_age,
            fetch_row_limit: self.config.fetch_row_limit,
        };
        self.cycle_running = true;
        self.loading = true;
        self.publish();

        let cache = Arc::clone(&self.cache);
        let registry = Arc::clone(&self.registry);
        let bandwidth = Arc::clone(&self.bandwidth);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = cycle::run_cycle(inputs, cache, registry, bandwidth).await;
            let _ = tx.send(EngineCommand::CycleFinished(Box::new(outcome)));
        });
    }

    async fn finish_cycle(&mut self, outcome: CycleOutcome) {
        self.cycle_running = false;

        let current = self.current_fingerprint();
        if current.as_deref() != Some(outcome.fingerprint.as_str()) {
            // Inputs moved on while the cycle ran; its results describe a
            // state nobody is looking at anymore.
            debug!("discarding stale cycle result");
            self.load_again = false;
            self.start_cycle();
            return;
        }

        for result in outcome.results {
            self.apply_layer_result(result);
        }

        // Evict cache entries no displayed layer references.
        let live: HashSet<DataSignature> = self
            .slots
            .values()
            .filter_map(|slot| slot.signature.clone())
            .collect();
        self.cache.retain(&live);

        let tx = self.tx.clone();
        let on_change: ChangeCallback = Arc::new(move || {
            let _ = tx.send(EngineCommand::Refresh);
        });
        self.subscription_warnings = self
            .subscriptions
            .reconcile(&outcome.desired_subscriptions, &self.registry, on_change)
            .await;

        if self.load_again {
            self.load_again = false;
            self.start_cycle();
        } else {
            self.loading = false;
            self.publish();
        }
    }

    fn apply_layer_result(&mut self, result: LayerResult) {
        let resolved = match result.outcome {
            LayerOutcome::Ready(entry) => Some(Ok(entry)),
            LayerOutcome::KeepPrevious(signature) => match self.cache.get(&signature) {
                // The owning layer's fetch completed within this same cycle;
                // share its stored result.
                Some(entry) => Some(Ok(entry)),
                // The owning fetch failed. Its error lands on that layer;
                // this one keeps whatever it showed before.
                None => {
                    debug!(layer = %result.layer_id, "shared fetch did not complete, keeping previous features");
                    None
                }
            },
            LayerOutcome::Failed(err) => Some(Err(err)),
        };
        let slot = self
            .slots
            .entry(result.layer_id.clone())
            .or_insert_with(|| LayerSlot {
                layer_id: result.layer_id.clone(),
                ..LayerSlot::default()
            });
        slot.warnings = result.warnings;
        match resolved {
            Some(Ok(entry)) => {
                slot.signature = Some(entry.signature.clone());
                slot.features = Arc::clone(&entry.features);
                slot.error = None;
            }
            Some(Err(err)) => {
                warn!(layer = %slot.layer_id, error = %err, "layer fetch failed");
                slot.error = Some(err);
            }
            None => {}
        }
    }

    fn start_zoom_to_data(&mut self) {
        if self.computing_extent {
            return;
        }
        self.computing_extent = true;
        let layers = self.layers.clone();
        let global_filters = self.global_filters.clone();
        let registry = Arc::clone(&self.registry);
        let limit = self.config.fetch_row_limit;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result =
                data_extent::aggregate_data_extent(&layers, &global_filters, &registry, limit)
                    .await;
            let _ = tx.send(EngineCommand::ExtentComputed(result));
        });
    }

    fn finish_zoom_to_data(&mut self, result: Result<Extent, EngineError>) {
        self.computing_extent = false;
        match result {
            Ok(extent) => {
                self.viewport = Some(Viewport {
                    extent,
                    zoom: self.config.default_zoom,
                });
                let _ = self.events.send(EngineEvent::ZoomedToData(extent));
                self.request_cycle();
            }
            Err(err) => {
                debug!(error = %err, "zoom to data unavailable");
                let _ = self.events.send(EngineEvent::DataExtentUnavailable);
            }
        }
    }

    fn start_hover(&mut self, feature: Feature) {
        let layer = feature
            .layer_id()
            .and_then(|id| self.layers.iter().find(|l| l.id() == id))
            .cloned();
        let tx = self.tx.clone();
        self.hover.on_hover(
            feature,
            layer,
            Arc::clone(&self.registry),
            move |identity, result| {
                let _ = tx.send(EngineCommand::HoverResolved { identity, result });
            },
        );
        self.publish();
    }

    fn current_fingerprint(&self) -> Option<String> {
        self.viewport.map(|viewport| {
            state::input_fingerprint(
                &self.layers,
                &viewport,
                &self.global_filters,
                &self.options,
                self.data_age,
            )
        })
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.build_snapshot());
        let _ = self.events.send(EngineEvent::SnapshotUpdated);
    }

    fn build_snapshot(&self) -> EngineSnapshot {
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                if !layer.enabled() {
                    return LayerSlot {
                        layer_id: layer.id().to_string(),
                        ..LayerSlot::default()
                    };
                }
                let mut slot = self
                    .slots
                    .get(layer.id())
                    .cloned()
                    .unwrap_or_else(|| LayerSlot {
                        layer_id: layer.id().to_string(),
                        ..LayerSlot::default()
                    });
                // Styling always reflects the current layer definition, even
                // when the features come from the cache.
                slot.style = layer.common().style.clone();
                slot
            })
            .collect();
        EngineSnapshot {
            layers,
            viewport: self.viewport,
            hover: self.hover.snapshot(),
            clicked: self.clicked.clone(),
            loading: self.loading,
            data_age: self.data_age,
            warnings: self.subscription_warnings.clone(),
        }
    }
}

fn build_ticker(mode: RefreshMode) -> Option<Interval> {
    match mode {
        RefreshMode::Interval { every_secs } if every_secs > 0 => {
            let period = Duration::from_secs(every_secs);
            Some(interval_at(Instant::now() + period, period))
        }
        _ => None,
    }
}

async fn tick_or_never(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_viewport_is_rejected_before_sending() {
        let (_engine, handle) = MapEngine::new(EngineConfig::default(), SourceRegistry::new());
        let viewport = Viewport {
            extent: Extent {
                min_x: 5.0,
                min_y: 0.0,
                max_x: -5.0,
                max_y: 1.0,
            },
            zoom: 1.0,
        };
        assert!(matches!(
            handle.set_viewport(viewport),
            Err(EngineError::InvalidExtent { .. })
        ));
    }

    #[test]
    fn test_only_interval_mode_builds_a_ticker() {
        assert!(build_ticker(RefreshMode::Static).is_none());
        assert!(build_ticker(RefreshMode::Realtime { throttle_ms: 100 }).is_none());
        assert!(build_ticker(RefreshMode::Interval { every_secs: 0 }).is_none());
    }

    #[tokio::test]
    async fn test_interval_ticker_is_built_under_a_runtime() {
        assert!(build_ticker(RefreshMode::Interval { every_secs: 5 }).is_some());
    }
}
