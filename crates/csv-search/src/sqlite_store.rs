//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] and [`Batch`] operation onto the tables created by
//! [`migrate`](crate::migrate). A batch wraps one `sqlx` transaction; the
//! lexical and spatial tables are keyed by the `records` rowid, which is
//! looked up inside the same transaction.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;

use csv_search_core::models::{Fields, Record, SpatialEntry, StoredEmbedding};
use csv_search_core::store::{Batch, Store, WriterGuard, WriterSlot};
use csv_search_core::vector::{decode_vector, encode_vector};
use csv_search_core::{Error, Result};

use crate::{db, migrate};

fn storage(e: sqlx::Error) -> Error {
    Error::storage(e.to_string())
}

fn decode_fields(id: &str, data: &str) -> Result<Fields> {
    serde_json::from_str(data)
        .map_err(|e| Error::Format(format!("decode metadata for {}: {}", id, e)))
}

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: WriterSlot,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: WriterSlot::new(),
        }
    }

    /// Connect to `db_path` and make sure the schema exists.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect(db_path).await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Unix timestamp of the last write to `(namespace, id)`.
    pub async fn updated_at(&self, namespace: &str, id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT updated_at FROM records WHERE dataset = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn stored_embedding(row: SqliteRow) -> Result<StoredEmbedding> {
    let id: String = row.try_get("id").map_err(storage)?;
    let data: String = row.try_get("data").map_err(storage)?;
    Ok(StoredEmbedding {
        fields: decode_fields(&id, &data)?,
        lat: row.try_get("lat").map_err(storage)?,
        lng: row.try_get("lng").map_err(storage)?,
        embedding: row.try_get("embedding").map_err(storage)?,
        id,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        migrate::ensure_schema(&self.pool).await
    }

    async fn begin_batch<'a>(&'a self) -> Result<Box<dyn Batch + 'a>> {
        let guard = self.writer.acquire()?;
        let tx = self.pool.begin().await.map_err(storage)?;
        Ok(Box::new(SqliteBatch {
            tx: Some(tx),
            _guard: guard,
            now: chrono::Utc::now().timestamp(),
        }))
    }

    async fn lookup_fingerprint(&self, namespace: &str, id: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT hash FROM records WHERE dataset = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)
    }

    fn scan_embeddings<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxStream<'a, Result<StoredEmbedding>> {
        sqlx::query(
            r#"
            SELECT r.id, r.data, r.lat, r.lng, v.embedding
            FROM records AS r
            INNER JOIN records_vec AS v
                ON r.dataset = v.dataset AND r.id = v.id
            WHERE r.dataset = ?
            "#,
        )
        .bind(namespace)
        .fetch(&self.pool)
        .map(|row| row.map_err(storage).and_then(stored_embedding))
        .boxed()
    }

    async fn get_record(&self, namespace: &str, id: &str) -> Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT id, data, lat, lng, hash FROM records WHERE dataset = ? AND id = ?",
        )
        .bind(namespace)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.try_get("id").map_err(storage)?;
        let data: String = row.try_get("data").map_err(storage)?;
        Ok(Some(Record {
            namespace: namespace.to_string(),
            fields: decode_fields(&id, &data)?,
            lat: row.try_get("lat").map_err(storage)?,
            lng: row.try_get("lng").map_err(storage)?,
            fingerprint: row.try_get("hash").map_err(storage)?,
            id,
        }))
    }

    async fn embedding(&self, namespace: &str, id: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM records_vec WHERE dataset = ? AND id = ?")
                .bind(namespace)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        blob.map(|b| decode_vector(&b)).transpose()
    }

    async fn lexical_entry(&self, namespace: &str, id: &str) -> Result<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT f.content FROM records_fts AS f
            INNER JOIN records AS r ON r.rowid = f.rowid
            WHERE r.dataset = ? AND r.id = ?
            "#,
        )
        .bind(namespace)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)
    }

    async fn spatial_entry(&self, namespace: &str, id: &str) -> Result<Option<SpatialEntry>> {
        let row = sqlx::query(
            r#"
            SELECT t.min_lat, t.max_lat, t.min_lng, t.max_lng FROM records_rtree AS t
            INNER JOIN records AS r ON r.rowid = t.id
            WHERE r.dataset = ? AND r.id = ?
            "#,
        )
        .bind(namespace)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|row| {
            Ok(SpatialEntry {
                min_lat: row.try_get("min_lat").map_err(storage)?,
                max_lat: row.try_get("max_lat").map_err(storage)?,
                min_lng: row.try_get("min_lng").map_err(storage)?,
                max_lng: row.try_get("max_lng").map_err(storage)?,
            })
        })
        .transpose()
    }

    async fn count_records(&self, namespace: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE dataset = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count as u64)
    }
}

/// Open batch transaction. Dropping it unfinished rolls back.
struct SqliteBatch {
    tx: Option<Transaction<'static, Sqlite>>,
    _guard: WriterGuard,
    /// Write time stamped on every record of the batch.
    now: i64,
}

impl SqliteBatch {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(Error::storage("batch transaction is no longer open")),
        }
    }

    async fn rowid(&mut self, namespace: &str, id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT rowid FROM records WHERE dataset = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await
            .map_err(storage)
    }

    async fn require_rowid(&mut self, namespace: &str, id: &str) -> Result<i64> {
        self.rowid(namespace, id).await?.ok_or_else(|| {
            Error::storage(format!("record {}/{} must be written first", namespace, id))
        })
    }
}

#[async_trait]
impl Batch for SqliteBatch {
    async fn lookup_fingerprint(&mut self, namespace: &str, id: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT hash FROM records WHERE dataset = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await
            .map_err(storage)
    }

    async fn upsert_record(&mut self, record: &Record) -> Result<()> {
        let data = serde_json::to_string(&record.fields)
            .map_err(|e| Error::storage(format!("encode metadata for {}: {}", record.id, e)))?;
        let now = self.now;
        sqlx::query(
            r#"
            INSERT INTO records (dataset, id, data, lat, lng, hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dataset, id) DO UPDATE SET
                data = excluded.data,
                lat = excluded.lat,
                lng = excluded.lng,
                hash = excluded.hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.namespace)
        .bind(&record.id)
        .bind(data)
        .bind(record.lat)
        .bind(record.lng)
        .bind(&record.fingerprint)
        .bind(now)
        .execute(self.conn()?)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn upsert_embedding(
        &mut self,
        namespace: &str,
        id: &str,
        vector: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO records_vec (dataset, id, embedding) VALUES (?, ?, ?)
            ON CONFLICT(dataset, id) DO UPDATE SET embedding = excluded.embedding
            "#,
        )
        .bind(namespace)
        .bind(id)
        .bind(encode_vector(vector))
        .execute(self.conn()?)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn remove_embedding(&mut self, namespace: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM records_vec WHERE dataset = ? AND id = ?")
            .bind(namespace)
            .bind(id)
            .execute(self.conn()?)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn upsert_lexical(&mut self, namespace: &str, id: &str, text: &str) -> Result<()> {
        let rowid = self.require_rowid(namespace, id).await?;
        let conn = self.conn()?;
        sqlx::query("DELETE FROM records_fts WHERE rowid = ?")
            .bind(rowid)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        sqlx::query("INSERT INTO records_fts (rowid, dataset, id, content) VALUES (?, ?, ?, ?)")
            .bind(rowid)
            .bind(namespace)
            .bind(id)
            .bind(text)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn remove_lexical(&mut self, namespace: &str, id: &str) -> Result<()> {
        let Some(rowid) = self.rowid(namespace, id).await? else {
            return Ok(());
        };
        sqlx::query("DELETE FROM records_fts WHERE rowid = ?")
            .bind(rowid)
            .execute(self.conn()?)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn upsert_spatial(
        &mut self,
        namespace: &str,
        id: &str,
        entry: SpatialEntry,
    ) -> Result<()> {
        let rowid = self.require_rowid(namespace, id).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO records_rtree (id, min_lat, max_lat, min_lng, max_lng) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(rowid)
        .bind(entry.min_lat)
        .bind(entry.max_lat)
        .bind(entry.min_lng)
        .bind(entry.max_lng)
        .execute(self.conn()?)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn remove_spatial(&mut self, namespace: &str, id: &str) -> Result<()> {
        let Some(rowid) = self.rowid(namespace, id).await? else {
            return Ok(());
        };
        sqlx::query("DELETE FROM records_rtree WHERE id = ?")
            .bind(rowid)
            .execute(self.conn()?)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::storage("batch transaction is no longer open"))?;
        tx.commit().await.map_err(storage)
    }

    async fn abort(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::storage("batch transaction is no longer open"))?;
        tx.rollback().await.map_err(storage)
    }
}
