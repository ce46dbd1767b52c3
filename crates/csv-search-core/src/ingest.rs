//! Ingestion pipeline: rows in, records and derived entries out.
//!
//! Each row goes through **Parse → Fingerprint → Skip | Embed + Stage**.
//! A row whose fingerprint matches the stored one is skipped without
//! calling the encoder. Changed rows are embedded (when they carry text)
//! and staged; a full batch is written inside one store transaction:
//!
//! ```text
//! begin ─▶ upsert record ─▶ lexical / spatial / embedding (set or clear) ─▶ … ─▶ commit
//! ```
//!
//! Encoder calls happen only while staging, never while a batch is open,
//! so the store connection is not held across an external call.
//!
//! The first error stops the run. Batches committed before it stay
//! committed and are reported in [`IngestFailure::committed`]; the staged
//! rows of the current batch are discarded. Dropping the future of
//! [`IngestPipeline::run`] likewise rolls back only the open batch.

use serde::Serialize;
use std::collections::HashMap;

use crate::columns::{resolve_columns, ColumnConfig, ResolvedColumns};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{normalize_namespace, Record, SpatialEntry};
use crate::record::{fingerprint, parse_row, ParsedRecord};
use crate::store::Store;

/// Rows per transaction when the caller does not choose.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Parameters of one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub namespace: String,
    /// Written rows per transaction; `0` selects [`DEFAULT_BATCH_SIZE`].
    pub batch_size: usize,
    pub columns: ColumnConfig,
}

impl IngestOptions {
    pub fn new(namespace: &str, columns: ColumnConfig) -> Self {
        Self {
            namespace: normalize_namespace(namespace),
            batch_size: DEFAULT_BATCH_SIZE,
            columns,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }
}

/// Counters of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub namespace: String,
    /// Data rows read (header excluded).
    pub rows_read: u64,
    /// Rows left untouched because their fingerprint was unchanged.
    pub rows_skipped: u64,
    pub rows_written: u64,
    pub embeddings_written: u64,
    pub batches_committed: u64,
}

/// Why and where a run stopped.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct IngestFailure {
    #[source]
    pub error: Error,
    /// 1-based row number (header is row 1), when the failure belongs to a
    /// row.
    pub row: Option<u64>,
    /// Rows committed by batches that completed before the failure.
    pub committed: u64,
}

/// One changed row waiting for its batch.
struct StagedRow {
    row: u64,
    record: Record,
    text: Option<String>,
    spatial: Option<SpatialEntry>,
    vector: Option<Vec<f32>>,
}

#[derive(Default)]
struct Progress {
    summary: IngestSummary,
    staged: Vec<StagedRow>,
    /// Fingerprints of staged rows, consulted before the store.
    pending: HashMap<String, String>,
}

/// Synchronizes a namespace with a sequence of rows.
///
/// Store and encoder are borrowed for the lifetime of the pipeline, so the
/// same pair can be shared with a query surface.
pub struct IngestPipeline<'a, S: ?Sized, E: ?Sized> {
    store: &'a S,
    encoder: &'a E,
}

impl<'a, S, E> IngestPipeline<'a, S, E>
where
    S: Store + ?Sized,
    E: EmbeddingProvider + ?Sized,
{
    pub fn new(store: &'a S, encoder: &'a E) -> Self {
        Self { store, encoder }
    }

    /// Ingest `rows` (data rows, header excluded) described by `header`.
    ///
    /// Column roles are resolved once up front; a
    /// [`Error::Configuration`] is returned before any row is looked at.
    /// Unreadable rows are passed in as `Err` and stop the run like any
    /// other row error.
    pub async fn run<H, I>(
        &self,
        opts: &IngestOptions,
        header: &[H],
        rows: I,
    ) -> std::result::Result<IngestSummary, IngestFailure>
    where
        H: AsRef<str>,
        I: IntoIterator<Item = Result<Vec<String>>>,
    {
        let namespace = normalize_namespace(&opts.namespace);
        let batch_size = opts.effective_batch_size();

        let cols = resolve_columns(header, &opts.columns).map_err(|error| IngestFailure {
            error,
            row: None,
            committed: 0,
        })?;
        tracing::info!(
            namespace = %namespace,
            id = %cols.id.name,
            text = ?cols.text_names(),
            metadata = cols.metadata.len(),
            batch_size,
            "ingest started"
        );

        let mut progress = Progress {
            summary: IngestSummary {
                namespace: namespace.clone(),
                ..Default::default()
            },
            ..Default::default()
        };

        // Header is row 1.
        for (offset, item) in rows.into_iter().enumerate() {
            let row = offset as u64 + 2;
            progress.summary.rows_read += 1;

            let staged = self
                .process_row(&namespace, &cols, row, item, &progress.pending)
                .await
                .map_err(|error| failure(&progress, error, Some(row)))?;

            let Some(staged) = staged else {
                progress.summary.rows_skipped += 1;
                continue;
            };
            progress
                .pending
                .insert(staged.record.id.clone(), staged.record.fingerprint.clone());
            progress.staged.push(staged);

            if progress.staged.len() >= batch_size {
                self.flush(&namespace, &mut progress).await?;
            }
        }
        if !progress.staged.is_empty() {
            self.flush(&namespace, &mut progress).await?;
        }

        let summary = progress.summary;
        tracing::info!(
            namespace = %summary.namespace,
            read = summary.rows_read,
            skipped = summary.rows_skipped,
            written = summary.rows_written,
            embeddings = summary.embeddings_written,
            batches = summary.batches_committed,
            "ingest finished"
        );
        Ok(summary)
    }

    /// Parse one row and decide whether it needs writing. `None` means
    /// unchanged.
    async fn process_row(
        &self,
        namespace: &str,
        cols: &ResolvedColumns,
        row: u64,
        item: Result<Vec<String>>,
        pending: &HashMap<String, String>,
    ) -> Result<Option<StagedRow>> {
        let cells = item?;
        let parsed = parse_row(&cells, cols, row)?;
        let fp = fingerprint(namespace, &parsed);

        let stored = match pending.get(&parsed.id) {
            Some(fp) => Some(fp.clone()),
            None => self.store.lookup_fingerprint(namespace, &parsed.id).await?,
        };
        if stored.as_deref() == Some(fp.as_str()) {
            tracing::debug!(namespace, id = %parsed.id, row, "row unchanged, skipping");
            return Ok(None);
        }

        let vector = if parsed.has_text() {
            Some(self.embed(&parsed, row).await?)
        } else {
            None
        };
        Ok(Some(stage(namespace, row, parsed, fp, vector)))
    }

    async fn embed(&self, parsed: &ParsedRecord, row: u64) -> Result<Vec<f32>> {
        let vector = self
            .encoder
            .embed(&parsed.embedding_text())
            .await
            .map_err(|e| match e {
                Error::Encoding(msg) => Error::encoding(format!("id {}: {}", parsed.id, msg)),
                other => other,
            })?;
        if vector.is_empty() {
            return Err(Error::encoding(format!(
                "row {}: encoder returned an empty vector",
                row
            )));
        }
        Ok(vector)
    }

    /// Write every staged row inside one transaction.
    async fn flush(
        &self,
        namespace: &str,
        progress: &mut Progress,
    ) -> std::result::Result<(), IngestFailure> {
        let staged = std::mem::take(&mut progress.staged);
        progress.pending.clear();

        let mut batch = self
            .store
            .begin_batch()
            .await
            .map_err(|error| failure(progress, error, staged.first().map(|s| s.row)))?;

        let mut embeddings = 0u64;
        for row in &staged {
            apply(batch.as_mut(), namespace, row)
                .await
                .map_err(|error| failure(progress, error, Some(row.row)))?;
            if row.vector.is_some() {
                embeddings += 1;
            }
        }
        batch
            .commit()
            .await
            .map_err(|error| failure(progress, error, staged.last().map(|s| s.row)))?;

        let summary = &mut progress.summary;
        summary.rows_written += staged.len() as u64;
        summary.embeddings_written += embeddings;
        summary.batches_committed += 1;
        tracing::info!(
            namespace,
            rows = staged.len(),
            committed = summary.rows_written,
            batch = summary.batches_committed,
            "batch committed"
        );
        Ok(())
    }
}

fn failure(progress: &Progress, error: Error, row: Option<u64>) -> IngestFailure {
    tracing::warn!(
        error = %error,
        row = ?row,
        committed = progress.summary.rows_written,
        "ingest aborted"
    );
    IngestFailure {
        error,
        row,
        committed: progress.summary.rows_written,
    }
}

fn stage(
    namespace: &str,
    row: u64,
    parsed: ParsedRecord,
    fingerprint: String,
    vector: Option<Vec<f32>>,
) -> StagedRow {
    let text = parsed.has_text().then(|| parsed.embedding_text());
    let spatial = parsed.spatial();
    StagedRow {
        row,
        record: Record {
            namespace: namespace.to_string(),
            id: parsed.id,
            fields: parsed.fields,
            lat: parsed.lat,
            lng: parsed.lng,
            fingerprint,
        },
        text,
        spatial,
        vector,
    }
}

/// Upsert the primary record and set or clear each derived entry.
async fn apply(
    batch: &mut (dyn crate::store::Batch + '_),
    namespace: &str,
    row: &StagedRow,
) -> Result<()> {
    let id = row.record.id.as_str();
    batch.upsert_record(&row.record).await?;

    match &row.text {
        Some(text) => batch.upsert_lexical(namespace, id, text).await?,
        None => batch.remove_lexical(namespace, id).await?,
    }
    match row.spatial {
        Some(entry) => batch.upsert_spatial(namespace, id, entry).await?,
        None => batch.remove_spatial(namespace, id).await?,
    }
    match &row.vector {
        Some(vector) => batch.upsert_embedding(namespace, id, vector).await?,
        None => batch.remove_embedding(namespace, id).await?,
    }
    Ok(())
}
