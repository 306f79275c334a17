//! Signature-keyed layer cache with in-flight fetch deduplication.
//!
//! The cache guarantees at most one fetch in flight per signature: the first
//! caller to look up a missing signature gets a [`FetchReservation`];
//! concurrent callers for the same signature are told the fetch is already in
//! flight and keep showing their stale layer rather than blocking. Stored
//! [`CachedLayer`] values are immutable; a changed signature always produces a
//! new entry. Eviction is reference-count-to-zero against the live layer set,
//! so the entry count stays bounded by the number of on-screen layers.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::feature::Feature;
use crate::signature::DataSignature;

/// An immutable, successfully fetched layer result. Styling is not cached;
/// it always comes from the current layer definition.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    pub signature: DataSignature,
    pub features: Arc<Vec<Feature>>,
}

/// Permission to perform the one in-flight fetch for a signature.
///
/// Dropping the reservation without completing it releases the slot so the
/// next cycle can retry.
pub struct FetchReservation {
    signature: DataSignature,
    pending: Arc<DashMap<DataSignature, ()>>,
}

impl FetchReservation {
    pub fn signature(&self) -> &DataSignature {
        &self.signature
    }
}

impl Drop for FetchReservation {
    fn drop(&mut self) {
        self.pending.remove(&self.signature);
    }
}

/// Outcome of a cache lookup.
pub enum CacheDecision {
    /// A previous fetch for this signature completed; reuse it.
    Cached(Arc<CachedLayer>),
    /// No entry and no fetch in flight; the caller must fetch.
    Fetch(FetchReservation),
    /// Another caller is already fetching this signature; skip and keep
    /// showing the stale layer.
    InFlight,
}

/// Per-engine signature cache. Never shared across engine instances.
pub struct SignatureCache {
    entries: DashMap<DataSignature, Arc<CachedLayer>>,
    pending: Arc<DashMap<DataSignature, ()>>,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Look up a signature, reserving the fetch slot on a miss.
    pub fn lookup_or_begin(&self, signature: &DataSignature) -> CacheDecision {
        if let Some(entry) = self.entries.get(signature) {
            trace!(signature = %signature, "cache hit");
            return CacheDecision::Cached(entry.value().clone());
        }
        if self
            .pending
            .insert(signature.clone(), ())
            .is_none()
        {
            CacheDecision::Fetch(FetchReservation {
                signature: signature.clone(),
                pending: Arc::clone(&self.pending),
            })
        } else {
            trace!(signature = %signature, "fetch already in flight, skipping");
            CacheDecision::InFlight
        }
    }

    /// Store a successful fetch result, releasing the reservation.
    pub fn complete(&self, reservation: FetchReservation, layer: CachedLayer) -> Arc<CachedLayer> {
        let entry = Arc::new(layer);
        self.entries
            .insert(reservation.signature.clone(), entry.clone());
        drop(reservation);
        entry
    }

    /// Look up an existing entry without reserving.
    pub fn get(&self, signature: &DataSignature) -> Option<Arc<CachedLayer>> {
        self.entries.get(signature).map(|e| e.value().clone())
    }

    /// Drop every entry whose signature is not referenced by the current
    /// layer set.
    pub fn retain(&self, live: &HashSet<DataSignature>) {
        self.entries.retain(|signature, _| live.contains(signature));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::filter::Filter;
    use crate::source::{FindOptions, Selection};
    use serde_json::json;

    fn signature(age: u64) -> DataSignature {
        DataSignature::for_table(
            &Filter::equals("a", json!(1)),
            &FindOptions {
                selection: Selection::Geometry {
                    column: "geom".into(),
                    tolerance: None,
                },
                limit: None,
            },
            age,
            &EngineOptions::default(),
        )
    }

    fn cached(signature: DataSignature) -> CachedLayer {
        CachedLayer {
            signature,
            features: Arc::new(Vec::new()),
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = SignatureCache::new();
        let sig = signature(0);

        let reservation = match cache.lookup_or_begin(&sig) {
            CacheDecision::Fetch(r) => r,
            _ => panic!("expected a fetch reservation"),
        };
        cache.complete(reservation, cached(sig.clone()));

        assert!(matches!(
            cache.lookup_or_begin(&sig),
            CacheDecision::Cached(_)
        ));
    }

    #[test]
    fn test_at_most_one_in_flight() {
        let cache = SignatureCache::new();
        let sig = signature(0);

        let first = cache.lookup_or_begin(&sig);
        assert!(matches!(first, CacheDecision::Fetch(_)));
        // Second concurrent caller must not fetch.
        assert!(matches!(cache.lookup_or_begin(&sig), CacheDecision::InFlight));
    }

    #[test]
    fn test_dropped_reservation_releases_slot() {
        let cache = SignatureCache::new();
        let sig = signature(0);

        match cache.lookup_or_begin(&sig) {
            CacheDecision::Fetch(reservation) => drop(reservation),
            _ => panic!("expected a fetch reservation"),
        }
        // Failed fetch: nothing stored, slot free again.
        assert!(matches!(cache.lookup_or_begin(&sig), CacheDecision::Fetch(_)));
    }

    #[test]
    fn test_retain_evicts_unreferenced() {
        let cache = SignatureCache::new();
        let old = signature(0);
        let new = signature(1);
        for sig in [&old, &new] {
            match cache.lookup_or_begin(sig) {
                CacheDecision::Fetch(r) => {
                    cache.complete(r, cached(sig.clone()));
                }
                _ => panic!("expected a fetch reservation"),
            }
        }
        assert_eq!(cache.len(), 2);

        let live: HashSet<DataSignature> = [new.clone()].into_iter().collect();
        cache.retain(&live);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&old).is_none());
        assert!(cache.get(&new).is_some());
    }
}
