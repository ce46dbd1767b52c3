//! Storage abstraction for csv-search.
//!
//! A store keeps four logical relations per namespace: primary records,
//! embedding vectors, lexical entries and spatial entries. The [`Store`]
//! trait covers schema setup and reads; every mutation goes through a
//! [`Batch`], the open transaction of one ingestion batch.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ensure_schema`](Store::ensure_schema) | Idempotent schema creation |
//! | [`begin_batch`](Store::begin_batch) | Open the single write transaction |
//! | [`lookup_fingerprint`](Store::lookup_fingerprint) | Stored fingerprint of a record |
//! | [`scan_embeddings`](Store::scan_embeddings) | Lazy scan of embedded records |
//! | [`get_record`](Store::get_record) | Primary record by key |
//!
//! At most one batch may be open per store. Dropping a [`Batch`] without
//! committing rolls it back.

pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Error, Result};
use crate::models::{Record, SpatialEntry, StoredEmbedding};

/// Abstract storage backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create every relation if it does not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    /// Open the batch transaction.
    ///
    /// Fails with [`Error::Storage`] while another batch is still open.
    async fn begin_batch<'a>(&'a self) -> Result<Box<dyn Batch + 'a>>;

    /// Fingerprint stored for `(namespace, id)`, if the record exists.
    async fn lookup_fingerprint(&self, namespace: &str, id: &str) -> Result<Option<String>>;

    /// Every record of `namespace` that has an embedding, in no particular
    /// order. Rows are produced lazily.
    fn scan_embeddings<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxStream<'a, Result<StoredEmbedding>>;

    async fn get_record(&self, namespace: &str, id: &str) -> Result<Option<Record>>;

    async fn embedding(&self, namespace: &str, id: &str) -> Result<Option<Vec<f32>>>;

    async fn lexical_entry(&self, namespace: &str, id: &str) -> Result<Option<String>>;

    async fn spatial_entry(&self, namespace: &str, id: &str) -> Result<Option<SpatialEntry>>;

    async fn count_records(&self, namespace: &str) -> Result<u64>;
}

/// An open write transaction.
///
/// All writes become visible together on [`commit`](Batch::commit). After
/// `commit` or `abort` every method fails with [`Error::Storage`].
#[async_trait]
pub trait Batch: Send {
    async fn lookup_fingerprint(&mut self, namespace: &str, id: &str) -> Result<Option<String>>;

    /// Insert or replace the primary record and its fingerprint.
    async fn upsert_record(&mut self, record: &Record) -> Result<()>;

    async fn upsert_embedding(&mut self, namespace: &str, id: &str, vector: &[f32])
        -> Result<()>;

    async fn remove_embedding(&mut self, namespace: &str, id: &str) -> Result<()>;

    async fn upsert_lexical(&mut self, namespace: &str, id: &str, text: &str) -> Result<()>;

    async fn remove_lexical(&mut self, namespace: &str, id: &str) -> Result<()>;

    async fn upsert_spatial(
        &mut self,
        namespace: &str,
        id: &str,
        entry: SpatialEntry,
    ) -> Result<()>;

    async fn remove_spatial(&mut self, namespace: &str, id: &str) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn abort(&mut self) -> Result<()>;
}

/// Enforces the one-open-batch rule for a store.
#[derive(Debug, Default, Clone)]
pub struct WriterSlot {
    open: Arc<AtomicBool>,
}

impl WriterSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot until the returned guard is dropped.
    pub fn acquire(&self) -> Result<WriterGuard> {
        self.open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::storage("a batch transaction is already open"))?;
        Ok(WriterGuard {
            open: self.open.clone(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Releases its [`WriterSlot`] on drop.
#[derive(Debug)]
pub struct WriterGuard {
    open: Arc<AtomicBool>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
    }
}

pub(crate) fn finished_batch() -> Error {
    Error::storage("batch transaction is no longer open")
}
