//! Database schema creation.
//!
//! Every statement is idempotent, so [`ensure_schema`] runs at the start of
//! each command rather than only from `csvs init`.
//!
//! # Schema
//!
//! - `records`: primary rows keyed by `(dataset, id)`: metadata JSON,
//!   coordinates, fingerprint and last write time.
//! - `records_vec`: embedding blobs keyed by `(dataset, id)`.
//! - `records_fts`: FTS5 table over the joined text, keyed by the
//!   record's rowid.
//! - `records_rtree`: R*Tree of point rectangles, keyed by the record's
//!   rowid.

use sqlx::SqlitePool;

use csv_search_core::{Error, Result};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        dataset TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL DEFAULT '{}',
        lat REAL,
        lng REAL,
        hash TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (dataset, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS records_vec (
        dataset TEXT NOT NULL,
        id TEXT NOT NULL,
        embedding BLOB NOT NULL,
        PRIMARY KEY (dataset, id)
    )
    "#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS records_fts USING fts5(
        dataset UNINDEXED,
        id UNINDEXED,
        content
    )
    "#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS records_rtree USING rtree(
        id,
        min_lat,
        max_lat,
        min_lng,
        max_lng
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(dataset, updated_at DESC)",
];

/// Create all tables and indexes that do not exist yet.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await.map_err(|e| {
            Error::schema(format!(
                "apply schema {:?}: {}",
                stmt.split_whitespace().take(6).collect::<Vec<_>>().join(" "),
                e
            ))
        })?;
    }
    tracing::debug!(statements = SCHEMA.len(), "schema ensured");
    Ok(())
}
