//! Core data types stored and returned by csv-search.

use serde::Serialize;
use std::collections::BTreeMap;

/// Namespace used when the caller leaves it blank.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Trim a namespace name, falling back to [`DEFAULT_NAMESPACE`].
pub fn normalize_namespace(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Metadata snapshot of one record: column name → cell value.
pub type Fields = BTreeMap<String, String>;

/// Primary record as persisted, keyed by `(namespace, id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub namespace: String,
    pub id: String,
    pub fields: Fields,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub fingerprint: String,
}

/// Degenerate bounding rectangle used for spatial range lookups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpatialEntry {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl SpatialEntry {
    pub fn point(lat: f64, lng: f64) -> Self {
        Self {
            min_lat: lat,
            max_lat: lat,
            min_lng: lng,
            max_lng: lng,
        }
    }
}

/// One row of [`Store::scan_embeddings`](crate::store::Store::scan_embeddings).
///
/// The vector is kept in its stored byte form; the retrieval engine decodes
/// it only for records that survive filtering.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub id: String,
    pub fields: Fields,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub embedding: Vec<u8>,
}
