//! GeoLayer - viewport-driven spatial data engine
//!
//! This library turns declarative layer queries (table-backed, raw-query-backed
//! or external-source-backed) into renderable feature collections for the
//! currently visible map region, while minimizing redundant fetch work and
//! staying responsive during pan/zoom.
//!
//! # High-Level API
//!
//! The [`engine`] module provides the top-level orchestrator:
//!
//! ```ignore
//! use geolayer::engine::{MapEngine, EngineHandle};
//! use geolayer::config::EngineConfig;
//! use geolayer::source::SourceRegistry;
//!
//! let (engine, handle) = MapEngine::new(EngineConfig::default(), registry);
//! tokio::spawn(engine.run());
//!
//! handle.set_layers(layers);
//! handle.set_viewport(viewport)?;
//! let snapshot = handle.snapshot();
//! ```

pub mod aggregation;
pub mod bandwidth;
pub mod cache;
pub mod config;
pub mod data_extent;
pub mod engine;
pub mod error;
pub mod extent;
pub mod feature;
pub mod filter;
pub mod hover;
pub mod layer;
pub mod resolver;
pub mod scale;
pub mod signature;
pub mod simplify;
pub mod source;
pub mod subscription;

/// Version of the GeoLayer library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
