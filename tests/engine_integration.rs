//! End-to-end engine tests against mock sources with call counters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use geolayer::aggregation::AggregationPolicy;
use geolayer::config::{EngineConfig, EngineOptions, RefreshMode};
use geolayer::engine::{EngineEvent, EngineHandle, EngineSnapshot, MapEngine};
use geolayer::extent::{Extent, Viewport};
use geolayer::feature::{keys, Feature, Geometry, GeometryKind};
use geolayer::filter::Filter;
use geolayer::hover::HoverDetail;
use geolayer::layer::{LayerCommon, LayerQuery, LayerStyle, TableLayer};
use geolayer::source::{
    BoxFuture, ChangeCallback, DataSource, FindOptions, Row, Selection, SourceError,
    SourceRegistry, SubscribeOptions, SubscriptionHandle,
};

struct MockSource {
    name: &'static str,
    row_count: u64,
    extent: Option<Extent>,
    subscribable: bool,
    finds: AtomicUsize,
    cluster_finds: AtomicUsize,
    probes: AtomicUsize,
    counts: AtomicUsize,
    geometry_sizes: AtomicUsize,
    other_sizes: AtomicUsize,
    subscribes: AtomicUsize,
    detail_fetches: AtomicUsize,
    callbacks: StdMutex<Vec<ChangeCallback>>,
}

impl MockSource {
    fn new(name: &'static str, row_count: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            row_count,
            extent: Some(Extent::new(0.0, 0.0, 3.0, 3.0).unwrap()),
            subscribable: false,
            finds: AtomicUsize::new(0),
            cluster_finds: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
            geometry_sizes: AtomicUsize::new(0),
            other_sizes: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            detail_fetches: AtomicUsize::new(0),
            callbacks: StdMutex::new(Vec::new()),
        })
    }

    fn subscribable(name: &'static str, row_count: u64) -> Arc<Self> {
        let mut source = Self::new(name, row_count);
        Arc::get_mut(&mut source).unwrap().subscribable = true;
        source
    }

    fn notify_change(&self) {
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            callback();
        }
    }
}

fn point_row(i: u64) -> Row {
    let mut row = Row::new();
    row.insert(
        "geom".into(),
        json!({"type": "Point", "coordinates": [i as f64, i as f64]}),
    );
    row.insert("id".into(), json!(i));
    row
}

fn cluster_row(count: u64, x: f64) -> Row {
    let mut row = Row::new();
    row.insert(
        "geom".into(),
        json!({"type": "Point", "coordinates": [x, 0.0]}),
    );
    row.insert(keys::COUNT.into(), json!(count));
    row
}

impl DataSource for MockSource {
    fn name(&self) -> &str {
        self.name
    }

    fn find<'a>(
        &'a self,
        _: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxFuture<'a, Result<Vec<Row>, SourceError>> {
        Box::pin(async move {
            match options.selection {
                Selection::Clusters { .. } => {
                    self.cluster_finds.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![cluster_row(1, 0.0), cluster_row(100, 1.0)])
                }
                _ => {
                    self.finds.fetch_add(1, Ordering::SeqCst);
                    Ok((0..self.row_count.min(10)).map(point_row).collect())
                }
            }
        })
    }

    fn find_one<'a>(
        &'a self,
        _: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxFuture<'a, Result<Option<Row>, SourceError>> {
        Box::pin(async move {
            if let Selection::Detail { .. } = options.selection {
                self.detail_fetches.fetch_add(1, Ordering::SeqCst);
                let mut row = Row::new();
                row.insert("name".into(), json!("cafe"));
                return Ok(Some(row));
            }
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.row_count == 0 {
                Ok(None)
            } else {
                Ok(Some(point_row(0)))
            }
        })
    }

    fn count<'a>(&'a self, _: &'a Filter) -> BoxFuture<'a, Result<u64, SourceError>> {
        Box::pin(async move {
            self.counts.fetch_add(1, Ordering::SeqCst);
            Ok(self.row_count)
        })
    }

    fn size<'a>(
        &'a self,
        _: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxFuture<'a, Result<u64, SourceError>> {
        Box::pin(async move {
            match options.selection {
                Selection::Geometry { .. } => {
                    self.geometry_sizes.fetch_add(1, Ordering::SeqCst);
                }
                _ => {
                    self.other_sizes.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(self.row_count * 100)
        })
    }

    fn extent<'a>(
        &'a self,
        _: &'a Filter,
        _: &'a str,
    ) -> BoxFuture<'a, Result<Option<Extent>, SourceError>> {
        Box::pin(async move { Ok(self.extent) })
    }

    fn supports_subscribe(&self) -> bool {
        self.subscribable
    }

    fn subscribe<'a>(
        &'a self,
        _: &'a Filter,
        _: &'a SubscribeOptions,
        on_change: ChangeCallback,
    ) -> BoxFuture<'a, Result<SubscriptionHandle, SourceError>> {
        Box::pin(async move {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.callbacks.lock().unwrap().push(on_change);
            Ok(SubscriptionHandle::new(CancellationToken::new()))
        })
    }
}

fn table_layer(id: &str, source: &str) -> LayerQuery {
    LayerQuery::Table(TableLayer {
        common: LayerCommon {
            id: id.into(),
            link_id: "link".into(),
            geometry_column: "geom".into(),
            style: LayerStyle::default(),
            disabled: false,
        },
        source_name: source.into(),
        id_columns: vec!["id".into()],
        base_filter: None,
        external_filters: Vec::new(),
        join_path: None,
        tooltip_columns: None,
    })
}

fn colored_layer(id: &str, source: &str, color: [u8; 4]) -> LayerQuery {
    let mut layer = table_layer(id, source);
    if let LayerQuery::Table(ref mut table) = layer {
        table.common.style.color = color;
    }
    layer
}

fn viewport_at(x: f64) -> Viewport {
    Viewport {
        extent: Extent::new(x, 0.0, x + 10.0, 10.0).unwrap(),
        zoom: 8.0,
    }
}

fn spawn_engine(sources: Vec<Arc<MockSource>>) -> EngineHandle {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register_table(source);
    }
    let (engine, handle) = MapEngine::new(EngineConfig::default(), registry);
    tokio::spawn(engine.run());
    handle
}

async fn wait_until<F>(rx: &mut watch::Receiver<EngineSnapshot>, condition: F) -> EngineSnapshot
where
    F: Fn(&EngineSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if condition(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("engine stopped");
        }
    })
    .await
    .expect("snapshot condition not reached")
}

fn layer_ready(snapshot: &EngineSnapshot, index: usize) -> bool {
    !snapshot.loading
        && snapshot
            .layers
            .get(index)
            .is_some_and(|slot| slot.signature.is_some())
}

#[tokio::test]
async fn test_fetch_once_then_serve_from_cache() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    let snapshot = wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    assert_eq!(snapshot.layers[0].features.len(), 3);
    assert_eq!(source.finds.load(Ordering::SeqCst), 1);
    assert_eq!(source.probes.load(Ordering::SeqCst), 1);

    // Unchanged inputs re-applied: the cycle runs again but every layer is
    // served from the cache with zero additional queries.
    handle.set_viewport(viewport_at(0.0)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.finds.load(Ordering::SeqCst), 1);
    assert_eq!(source.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_layers_sharing_a_signature_both_render() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    // Two layers with identical filters on the same source share one fetch;
    // both must still end up with the fetched features.
    handle.set_layers(vec![
        table_layer("l1", "places"),
        table_layer("l2", "places"),
    ]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    let snapshot = wait_until(&mut rx, |s| layer_ready(s, 0) && layer_ready(s, 1)).await;
    assert_eq!(snapshot.layers[0].features.len(), 3);
    assert_eq!(snapshot.layers[1].features.len(), 3);
    assert_eq!(snapshot.layers[0].signature, snapshot.layers[1].signature);
    assert_eq!(source.finds.load(Ordering::SeqCst), 1);
    assert_eq!(source.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recoloring_a_layer_needs_no_refetch() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![colored_layer("l1", "places", [255, 0, 0, 255])]);
    handle.set_viewport(viewport_at(0.0)).unwrap();
    let snapshot = wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    assert_eq!(snapshot.layers[0].style.color, [255, 0, 0, 255]);

    // Same data, new color: the snapshot picks up the color while the
    // features come from the cache.
    handle.set_layers(vec![colored_layer("l1", "places", [0, 0, 255, 255])]);
    let snapshot = wait_until(&mut rx, |s| {
        layer_ready(s, 0) && s.layers[0].style.color == [0, 0, 255, 255]
    })
    .await;
    assert_eq!(snapshot.layers[0].features.len(), 3);
    assert_eq!(source.finds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rapid_triggers_coalesce_into_one_followup() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![table_layer("l1", "places")]);
    for i in 0..10 {
        handle.set_viewport(viewport_at(i as f64)).unwrap();
    }

    let last = viewport_at(9.0);
    let snapshot =
        wait_until(&mut rx, |s| layer_ready(s, 0) && s.viewport == Some(last)).await;
    assert!(!snapshot.layers[0].features.is_empty());
    // Ten triggers never mean ten fetches: intermediate viewports are
    // skipped.
    assert!(source.finds.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_empty_probe_short_circuits_the_fetch() {
    let source = MockSource::new("places", 0);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    let snapshot = wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    assert!(snapshot.layers[0].features.is_empty());
    assert!(snapshot.layers[0].error.is_none());
    assert_eq!(source.probes.load(Ordering::SeqCst), 1);
    assert_eq!(source.finds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_row_limit_policy_switches_to_clusters() {
    let source = MockSource::new("places", 5000);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_options(EngineOptions {
        aggregation: AggregationPolicy::RowLimit { limit: 1000 },
        refresh: RefreshMode::Static,
    });
    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    let snapshot = wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    let features = &snapshot.layers[0].features;
    assert_eq!(features.len(), 2);
    assert!(features.iter().all(|f| f.cluster_count().is_some()));
    assert_eq!(source.counts.load(Ordering::SeqCst), 1);
    assert_eq!(source.cluster_finds.load(Ordering::SeqCst), 1);
    assert_eq!(source.finds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_size_probe_selects_geometry_only() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    // Default options use the time-budget policy, so the decision probe
    // estimates the transfer size of the geometry payload alone.
    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    assert_eq!(source.geometry_sizes.load(Ordering::SeqCst), 1);
    assert_eq!(source.other_sizes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_layer_does_not_poison_the_rest() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![
        table_layer("good", "places"),
        table_layer("bad", "no-such-source"),
    ]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    let snapshot = wait_until(&mut rx, |s| {
        layer_ready(s, 0) && s.layers.get(1).is_some_and(|l| l.error.is_some())
    })
    .await;
    assert_eq!(snapshot.layers[0].features.len(), 3);
    assert!(snapshot.layers[1].features.is_empty());
}

#[tokio::test]
async fn test_realtime_layers_share_one_subscription() {
    let source = MockSource::subscribable("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_options(EngineOptions {
        aggregation: AggregationPolicy::default(),
        refresh: RefreshMode::Realtime { throttle_ms: 0 },
    });
    // Two layers with identical filters on the same source.
    handle.set_layers(vec![
        table_layer("l1", "places"),
        table_layer("l2", "places"),
    ]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
    let finds_before = source.finds.load(Ordering::SeqCst);

    // A change notification bumps the data age and refetches.
    source.notify_change();
    wait_until(&mut rx, |s| s.data_age == 1 && layer_ready(s, 0)).await;
    assert!(source.finds.load(Ordering::SeqCst) > finds_before);
    // Panning did not reopen the subscription.
    assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zoom_to_data_moves_the_viewport() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut events = handle.subscribe_events();
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.zoom_to_data();

    let extent = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let EngineEvent::ZoomedToData(extent) = events.recv().await.unwrap() {
                return extent;
            }
        }
    })
    .await
    .expect("no zoom event");
    assert_eq!(extent.to_array(), [0.0, 0.0, 3.0, 3.0]);

    let snapshot = wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    assert_eq!(
        snapshot.viewport,
        Some(Viewport { extent, zoom: 1.0 })
    );
}

#[tokio::test]
async fn test_hover_resolves_detail_for_final_target_only() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.set_viewport(viewport_at(0.0)).unwrap();
    wait_until(&mut rx, |s| layer_ready(s, 0)).await;

    let feature = |id: u64| {
        let mut properties = serde_json::Map::new();
        properties.insert(keys::ID.into(), json!({"id": id}));
        properties.insert(keys::LAYER_ID.into(), json!("l1"));
        Feature::new(
            Geometry {
                kind: GeometryKind::Point,
                coordinates: json!([id as f64, 0.0]),
            },
            properties,
        )
    };

    // Two hovers inside the debounce window: only the second resolves.
    handle.hover(feature(1));
    handle.hover(feature(2));

    let snapshot = wait_until(&mut rx, |s| {
        matches!(s.hover.detail, HoverDetail::Resolved(_))
    })
    .await;
    assert_eq!(snapshot.hover.identity.as_deref(), Some(feature(2).identity().as_str()));
    match &snapshot.hover.detail {
        HoverDetail::Resolved(value) => assert_eq!(value["name"], "cafe"),
        other => panic!("expected resolved detail, got {other:?}"),
    }
    assert_eq!(source.detail_fetches.load(Ordering::SeqCst), 1);

    // Pointer leaves: the session resets.
    handle.hover_end();
    let snapshot = wait_until(&mut rx, |s| s.hover.detail == HoverDetail::None).await;
    assert!(snapshot.hover.identity.is_none());
}

#[tokio::test]
async fn test_forced_refresh_bypasses_the_cache() {
    let source = MockSource::new("places", 3);
    let handle = spawn_engine(vec![source.clone()]);
    let mut rx = handle.watch_snapshots();

    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.set_viewport(viewport_at(0.0)).unwrap();
    wait_until(&mut rx, |s| layer_ready(s, 0)).await;
    assert_eq!(source.finds.load(Ordering::SeqCst), 1);

    handle.refresh();
    wait_until(&mut rx, |s| s.data_age == 1 && layer_ready(s, 0)).await;
    assert_eq!(source.finds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_interval_refresh_keeps_data_fresh() {
    let source = MockSource::new("places", 3);
    let mut registry = SourceRegistry::new();
    registry.register_table(source.clone());
    let (engine, handle) = MapEngine::new(EngineConfig::default(), registry);
    tokio::spawn(engine.run());
    let mut rx = handle.watch_snapshots();

    handle.set_options(EngineOptions {
        aggregation: AggregationPolicy::default(),
        refresh: RefreshMode::Interval { every_secs: 1 },
    });
    handle.set_layers(vec![table_layer("l1", "places")]);
    handle.set_viewport(viewport_at(0.0)).unwrap();

    wait_until(&mut rx, |s| s.data_age >= 2 && layer_ready(s, 0)).await;
    assert!(source.finds.load(Ordering::SeqCst) >= 3);
}
