//! In-memory [`Store`] implementation for testing and embedding.
//!
//! Committed state lives in `HashMap`s behind a `std::sync::RwLock`. A batch
//! records its writes as a list of pending operations and applies them
//! under one write lock on commit, so readers never observe a partial
//! batch.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{Error, Result};
use crate::models::{Record, SpatialEntry, StoredEmbedding};
use crate::vector::{decode_vector, encode_vector};

use super::{finished_batch, Batch, Store, WriterGuard, WriterSlot};

type Key = (String, String);

fn key(namespace: &str, id: &str) -> Key {
    (namespace.to_string(), id.to_string())
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<Key, Record>,
    vectors: HashMap<Key, Vec<u8>>,
    lexical: HashMap<Key, String>,
    spatial: HashMap<Key, SpatialEntry>,
}

enum PendingOp {
    Record(Record),
    Embedding(Key, Option<Vec<u8>>),
    Lexical(Key, Option<String>),
    Spatial(Key, Option<SpatialEntry>),
}

fn set_or_remove<V>(map: &mut HashMap<Key, V>, key: Key, value: Option<V>) {
    match value {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl MemoryState {
    fn apply(&mut self, op: PendingOp) {
        match op {
            PendingOp::Record(rec) => {
                self.records
                    .insert(key(&rec.namespace, &rec.id), rec);
            }
            PendingOp::Embedding(k, v) => set_or_remove(&mut self.vectors, k, v),
            PendingOp::Lexical(k, v) => set_or_remove(&mut self.lexical, k, v),
            PendingOp::Spatial(k, v) => set_or_remove(&mut self.spatial, k, v),
        }
    }
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    writer: WriterSlot,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| Error::storage("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn begin_batch<'a>(&'a self) -> Result<Box<dyn Batch + 'a>> {
        let guard = self.writer.acquire()?;
        Ok(Box::new(MemoryBatch {
            store: self,
            pending: Vec::new(),
            guard: Some(guard),
        }))
    }

    async fn lookup_fingerprint(&self, namespace: &str, id: &str) -> Result<Option<String>> {
        let state = self.read()?;
        Ok(state
            .records
            .get(&key(namespace, id))
            .map(|r| r.fingerprint.clone()))
    }

    fn scan_embeddings<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxStream<'a, Result<StoredEmbedding>> {
        let snapshot = self.read().map(|state| {
            let mut rows: Vec<StoredEmbedding> = state
                .vectors
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .filter_map(|(k, bytes)| {
                    state.records.get(k).map(|rec| StoredEmbedding {
                        id: rec.id.clone(),
                        fields: rec.fields.clone(),
                        lat: rec.lat,
                        lng: rec.lng,
                        embedding: bytes.clone(),
                    })
                })
                .collect();
            rows.sort_by(|a, b| a.id.cmp(&b.id));
            rows
        });
        match snapshot {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn get_record(&self, namespace: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.read()?.records.get(&key(namespace, id)).cloned())
    }

    async fn embedding(&self, namespace: &str, id: &str) -> Result<Option<Vec<f32>>> {
        let state = self.read()?;
        state
            .vectors
            .get(&key(namespace, id))
            .map(|bytes| decode_vector(bytes.as_slice()))
            .transpose()
    }

    async fn lexical_entry(&self, namespace: &str, id: &str) -> Result<Option<String>> {
        Ok(self.read()?.lexical.get(&key(namespace, id)).cloned())
    }

    async fn spatial_entry(&self, namespace: &str, id: &str) -> Result<Option<SpatialEntry>> {
        Ok(self.read()?.spatial.get(&key(namespace, id)).copied())
    }

    async fn count_records(&self, namespace: &str) -> Result<u64> {
        let state = self.read()?;
        Ok(state.records.keys().filter(|(ns, _)| ns == namespace).count() as u64)
    }
}

struct MemoryBatch<'a> {
    store: &'a InMemoryStore,
    pending: Vec<PendingOp>,
    /// `None` once the batch has been committed or aborted.
    guard: Option<WriterGuard>,
}

impl MemoryBatch<'_> {
    fn push(&mut self, op: PendingOp) -> Result<()> {
        if self.guard.is_none() {
            return Err(finished_batch());
        }
        self.pending.push(op);
        Ok(())
    }
}

#[async_trait]
impl Batch for MemoryBatch<'_> {
    async fn lookup_fingerprint(&mut self, namespace: &str, id: &str) -> Result<Option<String>> {
        if self.guard.is_none() {
            return Err(finished_batch());
        }
        let staged = self.pending.iter().rev().find_map(|op| match op {
            PendingOp::Record(rec) if rec.namespace == namespace && rec.id == id => {
                Some(rec.fingerprint.clone())
            }
            _ => None,
        });
        match staged {
            Some(fp) => Ok(Some(fp)),
            None => self.store.lookup_fingerprint(namespace, id).await,
        }
    }

    async fn upsert_record(&mut self, record: &Record) -> Result<()> {
        self.push(PendingOp::Record(record.clone()))
    }

    async fn upsert_embedding(
        &mut self,
        namespace: &str,
        id: &str,
        vector: &[f32],
    ) -> Result<()> {
        self.push(PendingOp::Embedding(
            key(namespace, id),
            Some(encode_vector(vector)),
        ))
    }

    async fn remove_embedding(&mut self, namespace: &str, id: &str) -> Result<()> {
        self.push(PendingOp::Embedding(key(namespace, id), None))
    }

    async fn upsert_lexical(&mut self, namespace: &str, id: &str, text: &str) -> Result<()> {
        self.push(PendingOp::Lexical(key(namespace, id), Some(text.to_string())))
    }

    async fn remove_lexical(&mut self, namespace: &str, id: &str) -> Result<()> {
        self.push(PendingOp::Lexical(key(namespace, id), None))
    }

    async fn upsert_spatial(
        &mut self,
        namespace: &str,
        id: &str,
        entry: SpatialEntry,
    ) -> Result<()> {
        self.push(PendingOp::Spatial(key(namespace, id), Some(entry)))
    }

    async fn remove_spatial(&mut self, namespace: &str, id: &str) -> Result<()> {
        self.push(PendingOp::Spatial(key(namespace, id), None))
    }

    async fn commit(&mut self) -> Result<()> {
        let guard = self.guard.take().ok_or_else(finished_batch)?;
        let mut state = self
            .store
            .state
            .write()
            .map_err(|_| Error::storage("in-memory store lock poisoned"))?;
        for op in self.pending.drain(..) {
            state.apply(op);
        }
        drop(state);
        drop(guard);
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.guard.take().ok_or_else(finished_batch)?;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fields;

    fn record(id: &str, fingerprint: &str) -> Record {
        let mut fields = Fields::new();
        fields.insert("id".to_string(), id.to_string());
        Record {
            namespace: "ns".to_string(),
            id: id.to_string(),
            fields,
            lat: None,
            lng: None,
            fingerprint: fingerprint.to_string(),
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = InMemoryStore::new();
        let mut batch = store.begin_batch().await.unwrap();
        batch.upsert_record(&record("1", "fp1")).await.unwrap();
        batch.upsert_embedding("ns", "1", &[1.0, 0.0]).await.unwrap();
        batch.upsert_lexical("ns", "1", "hello").await.unwrap();

        assert_eq!(batch.lookup_fingerprint("ns", "1").await.unwrap().as_deref(), Some("fp1"));
        assert!(store.get_record("ns", "1").await.unwrap().is_none());

        batch.commit().await.unwrap();
        drop(batch);

        assert_eq!(store.lookup_fingerprint("ns", "1").await.unwrap().as_deref(), Some("fp1"));
        assert_eq!(store.embedding("ns", "1").await.unwrap(), Some(vec![1.0, 0.0]));
        assert_eq!(store.lexical_entry("ns", "1").await.unwrap().as_deref(), Some("hello"));
        assert_eq!(store.count_records("ns").await.unwrap(), 1);
        assert_eq!(store.count_records("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_batch_rolls_back() {
        let store = InMemoryStore::new();
        {
            let mut batch = store.begin_batch().await.unwrap();
            batch.upsert_record(&record("1", "fp1")).await.unwrap();
        }
        assert!(store.get_record("ns", "1").await.unwrap().is_none());
        // the slot is free again
        let mut batch = store.begin_batch().await.unwrap();
        batch.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_open_batch_is_rejected() {
        let store = InMemoryStore::new();
        let _first = store.begin_batch().await.unwrap();
        let err = store.begin_batch().await.err().unwrap();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_finished_batch_refuses_writes() {
        let store = InMemoryStore::new();
        let mut batch = store.begin_batch().await.unwrap();
        batch.commit().await.unwrap();
        let err = batch.upsert_record(&record("1", "fp")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(batch.commit().await.is_err());
        assert!(batch.abort().await.is_err());
    }

    #[tokio::test]
    async fn test_remove_clears_derived_entries() {
        let store = InMemoryStore::new();
        let mut batch = store.begin_batch().await.unwrap();
        batch.upsert_record(&record("1", "fp1")).await.unwrap();
        batch.upsert_spatial("ns", "1", SpatialEntry::point(1.0, 2.0)).await.unwrap();
        batch.upsert_embedding("ns", "1", &[0.5]).await.unwrap();
        batch.commit().await.unwrap();
        drop(batch);

        let mut batch = store.begin_batch().await.unwrap();
        batch.remove_spatial("ns", "1").await.unwrap();
        batch.remove_embedding("ns", "1").await.unwrap();
        batch.commit().await.unwrap();
        drop(batch);

        assert!(store.spatial_entry("ns", "1").await.unwrap().is_none());
        assert!(store.embedding("ns", "1").await.unwrap().is_none());
        assert!(store.get_record("ns", "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_only_yields_embedded_records_of_namespace() {
        let store = InMemoryStore::new();
        let mut batch = store.begin_batch().await.unwrap();
        for id in ["b", "a", "c"] {
            batch.upsert_record(&record(id, "fp")).await.unwrap();
        }
        batch.upsert_embedding("ns", "b", &[1.0]).await.unwrap();
        batch.upsert_embedding("ns", "a", &[2.0]).await.unwrap();
        batch.commit().await.unwrap();
        drop(batch);

        let rows: Vec<StoredEmbedding> = store
            .scan_embeddings("ns")
            .map(|r| r.unwrap())
            .collect()
            .await;
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(decode_vector(&rows[0].embedding).unwrap(), vec![2.0]);

        assert_eq!(store.scan_embeddings("other").count().await, 0);
    }
}
