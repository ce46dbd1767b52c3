//! Ranked retrieval over stored embeddings.
//!
//! Retrieval is exhaustive: every embedded record of the namespace is
//! considered, metadata filters are applied first, and only the survivors
//! are decoded and scored.
//!
//! # Ranking
//!
//! 1. Enumerate every record with an embedding via
//!    [`Store::scan_embeddings`].
//! 2. Drop records failing any [`Filter`] (all filters must match).
//! 3. Score survivors by cosine similarity to the query vector.
//! 4. Sort by score descending, ties broken by ascending id.
//! 5. Keep the first `limit` hits.
//!
//! The store is read-only here, so an abandoned search leaves nothing
//! behind.

use futures::TryStreamExt;
use serde::Serialize;
use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::models::{normalize_namespace, Fields, StoredEmbedding};
use crate::store::Store;
use crate::vector::{cosine_similarity, decode_vector};

/// Result limit used when the caller does not pick one.
pub const DEFAULT_LIMIT: usize = 10;

/// Exact, case-sensitive equality test against one metadata field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

impl Filter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Parse the `field=value` form.
    ///
    /// The field is trimmed and must be non-empty; the value is kept as is
    /// and may be empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let (field, value) = raw
            .split_once('=')
            .ok_or_else(|| Error::invalid_request("filter must be in the form field=value"))?;
        let field = field.trim();
        if field.is_empty() {
            return Err(Error::invalid_request("filter field must not be empty"));
        }
        Ok(Self::new(field, value))
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        fields.get(&self.field) == Some(&self.value)
    }
}

/// A ranked retrieval request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub namespace: String,
    pub query_vec: Vec<f32>,
    pub limit: usize,
    pub filters: Vec<Filter>,
}

impl SearchRequest {
    pub fn new(namespace: &str, query_vec: Vec<f32>) -> Self {
        Self {
            namespace: normalize_namespace(namespace),
            query_vec,
            limit: DEFAULT_LIMIT,
            filters: Vec::new(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(rename = "dataset")]
    pub namespace: String,
    pub id: String,
    #[serde(skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
}

/// Score descending, then id ascending. A NaN score sorts after every
/// number so the order stays total.
fn rank(a: &SearchHit, b: &SearchHit) -> Ordering {
    let key = |hit: &SearchHit| {
        if hit.score.is_nan() {
            f64::NEG_INFINITY
        } else {
            hit.score
        }
    };
    key(b).total_cmp(&key(a)).then_with(|| a.id.cmp(&b.id))
}

/// Rank the embedded records of `req.namespace` against `req.query_vec`.
///
/// An empty namespace yields `Ok(vec![])`. A zero `limit` is rejected with
/// [`Error::InvalidRequest`]; an undecodable stored vector surfaces as
/// [`Error::Format`].
pub async fn search<S: Store + ?Sized>(store: &S, req: &SearchRequest) -> Result<Vec<SearchHit>> {
    if req.limit == 0 {
        return Err(Error::invalid_request("limit must be greater than zero"));
    }
    let namespace = normalize_namespace(&req.namespace);

    let mut hits: Vec<SearchHit> = Vec::new();
    let mut scanned = 0usize;
    let mut rows = store.scan_embeddings(&namespace);
    while let Some(row) = rows.try_next().await? {
        scanned += 1;
        let StoredEmbedding {
            id,
            fields,
            lat,
            lng,
            embedding,
        } = row;
        if !req.filters.iter().all(|f| f.matches(&fields)) {
            continue;
        }
        let vector = decode_vector(&embedding)?;
        hits.push(SearchHit {
            namespace: namespace.clone(),
            id,
            fields,
            score: cosine_similarity(&req.query_vec, &vector),
            lat,
            lng,
        });
    }

    hits.sort_by(rank);
    hits.truncate(req.limit);

    tracing::debug!(
        namespace = %namespace,
        scanned,
        returned = hits.len(),
        "search complete"
    );
    Ok(hits)
}
