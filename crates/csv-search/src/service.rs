//! Application facade shared by the CLI and the HTTP server.
//!
//! A [`Service`] owns the one store and the one encoder of the process.
//! The encoder is wrapped in a [`SerializedProvider`], so ingestion and
//! query encoding never drive the model concurrently.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use csv_search_core::ingest::{IngestFailure, IngestOptions, IngestPipeline, IngestSummary};
use csv_search_core::models::{normalize_namespace, Fields, SpatialEntry};
use csv_search_core::search::{search, Filter, SearchHit, SearchRequest};
use csv_search_core::store::Store;
use csv_search_core::{EmbeddingProvider, Error, Result, SerializedProvider};
use serde::Serialize;

use crate::config::Config;
use crate::csv_source::CsvSource;
use crate::embedding::create_provider;
use crate::sqlite_store::SqliteStore;

pub type SharedEncoder = SerializedProvider<Box<dyn EmbeddingProvider>>;

/// One ranked query as received from a front-end.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub namespace: String,
    pub text: String,
    pub top_k: usize,
    pub filters: Vec<Filter>,
}

/// A stored record together with the derived entries it currently has.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub dataset: String,
    pub id: String,
    pub fields: Fields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    pub fingerprint: String,
    pub updated_at: Option<String>,
    pub embedding_dims: Option<usize>,
    pub lexical: Option<String>,
    pub spatial: Option<SpatialEntry>,
}

#[derive(Clone)]
pub struct Service {
    store: Arc<SqliteStore>,
    encoder: Arc<SharedEncoder>,
}

impl Service {
    pub fn new(store: SqliteStore, encoder: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            store: Arc::new(store),
            encoder: Arc::new(SerializedProvider::new(encoder)),
        }
    }

    /// Open the configured database and embedding provider.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let encoder = create_provider(&config.embedding)?;
        let store = SqliteStore::open(&config.db_path()).await?;
        Ok(Self::new(store, encoder))
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn encoder(&self) -> &SharedEncoder {
        &self.encoder
    }

    /// Ingest the CSV file at `csv` into `opts.namespace`.
    pub async fn ingest(
        &self,
        opts: &IngestOptions,
        csv: &Path,
    ) -> std::result::Result<IngestSummary, IngestFailure> {
        let not_started = |error: Error| IngestFailure {
            row: match &error {
                Error::Record { row, .. } => Some(*row),
                _ => None,
            },
            error,
            committed: 0,
        };
        let source = CsvSource::open(csv).map_err(not_started)?;
        tracing::info!(csv = %csv.display(), namespace = %opts.namespace, "reading CSV");

        let (header, rows) = source.into_rows();
        IngestPipeline::new(self.store.as_ref(), self.encoder.as_ref())
            .run(opts, &header, rows)
            .await
    }

    /// Encode `query.text` and rank the namespace against it.
    ///
    /// With a `deadline`, the whole operation (encoding included) must
    /// finish in time or fails with [`Error::Timeout`].
    pub async fn search(
        &self,
        query: &SearchQuery,
        deadline: Option<Duration>,
    ) -> Result<Vec<SearchHit>> {
        let work = self.search_inner(query);
        match deadline {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                Error::Timeout(format!("search did not finish within {:?}", limit))
            })?,
            None => work.await,
        }
    }

    /// Look up one record and its derived entries.
    pub async fn get(&self, namespace: &str, id: &str) -> Result<Option<RecordView>> {
        let namespace = normalize_namespace(namespace);
        let Some(record) = self.store.get_record(&namespace, id).await? else {
            return Ok(None);
        };
        let updated_at = self
            .store
            .updated_at(&namespace, id)
            .await?
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.to_rfc3339());

        Ok(Some(RecordView {
            embedding_dims: self.store.embedding(&namespace, id).await?.map(|v| v.len()),
            lexical: self.store.lexical_entry(&namespace, id).await?,
            spatial: self.store.spatial_entry(&namespace, id).await?,
            dataset: record.namespace,
            id: record.id,
            fields: record.fields,
            lat: record.lat,
            lng: record.lng,
            fingerprint: record.fingerprint,
            updated_at,
        }))
    }

    async fn search_inner(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(Error::invalid_request("query must not be empty"));
        }
        let query_vec = self.encoder.embed(text).await?;
        let request = query
            .filters
            .iter()
            .cloned()
            .fold(
                SearchRequest::new(&query.namespace, query_vec).with_limit(query.top_k),
                SearchRequest::with_filter,
            );
        search(self.store.as_ref(), &request).await
    }
}
