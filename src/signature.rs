//! Deterministic fetch-plan fingerprints.
//!
//! A signature captures everything observable about a fetch: the resolved
//! filter, the selection/options, the monotonically increasing data age, and
//! a mode discriminator. Semantically identical plans hash to the same
//! string; any observable difference (including a forced refresh) changes it.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::config::EngineOptions;
use crate::extent::Extent;
use crate::filter::Filter;
use crate::source::FindOptions;

/// A deterministic string fingerprint of a fetch plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSignature(String);

impl DataSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn encode<T: Serialize + fmt::Debug>(parts: &T) -> Self {
        let encoded =
            serde_json::to_string(parts).unwrap_or_else(|_| format!("{parts:?}"));
        DataSignature(encoded)
    }

    /// Signature for a table-backed fetch.
    ///
    /// The engine-wide options are folded in so flipping the aggregation
    /// policy or refresh mode invalidates cached layers.
    pub fn for_table(
        filter: &Filter,
        options: &FindOptions,
        data_age: u64,
        engine_options: &EngineOptions,
    ) -> Self {
        #[derive(Serialize, Debug)]
        struct Parts<'a> {
            kind: &'static str,
            filter: &'a Filter,
            options: &'a FindOptions,
            data_age: u64,
            engine_options: &'a EngineOptions,
        }
        Self::encode(&Parts {
            kind: "table",
            filter,
            options,
            data_age,
            engine_options,
        })
    }

    /// Signature for a raw-query-backed fetch.
    pub fn for_raw_query(sql: &str, params: &Value, data_age: u64) -> Self {
        #[derive(Serialize, Debug)]
        struct Parts<'a> {
            kind: &'static str,
            sql: &'a str,
            params: &'a Value,
            data_age: u64,
        }
        Self::encode(&Parts {
            kind: "raw_query",
            sql,
            params,
            data_age,
        })
    }

    /// Signature for an external-source fetch.
    pub fn for_external(query: &str, bbox: &Extent, data_age: u64) -> Self {
        #[derive(Serialize, Debug)]
        struct Parts<'a> {
            kind: &'static str,
            query: &'a str,
            bbox: [f64; 4],
            data_age: u64,
        }
        Self::encode(&Parts {
            kind: "external",
            query,
            bbox: bbox.to_array(),
            data_age,
        })
    }
}

impl fmt::Display for DataSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
