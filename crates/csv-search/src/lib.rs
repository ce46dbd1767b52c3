//! # csv-search
//!
//! **Semantic search over CSV datasets, backed by SQLite.**
//!
//! Rows of a CSV file are keyed by an identifier column, fingerprinted,
//! embedded and stored together with a lexical (FTS5) and a spatial
//! (R*Tree) entry. Queries are ranked by cosine similarity with optional
//! exact-match metadata filters, from the CLI or over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌────────────────┐
//! │  CSV file   │──▶│ IngestPipeline   │──▶│    SQLite      │
//! │ (csv_source)│   │ parse+hash+embed │   │ rows/vec/fts/rt│
//! └─────────────┘   └──────────────────┘   └───────┬────────┘
//!                                                  │
//!                           ┌──────────────────────┤
//!                           ▼                      ▼
//!                      ┌──────────┐          ┌──────────┐
//!                      │   CLI    │          │   HTTP   │
//!                      │  (csvs)  │          │ (server) │
//!                      └──────────┘          └──────────┘
//! ```
//!
//! The storage-agnostic logic (column resolution, fingerprints, the
//! pipeline, ranking) lives in `csv-search-core` and is re-exported here.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`csv_source`] | CSV reader producing header and rows |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Idempotent schema creation |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` trait |
//! | [`embedding`] | Embedding providers: OpenAI, Ollama, fastembed, hashing |
//! | [`service`] | Facade shared by the CLI and the server |
//! | [`server`] | HTTP search server (Axum) with CORS |

pub mod config;
pub mod csv_source;
pub mod db;
pub mod embedding;
pub mod migrate;
pub mod server;
pub mod service;
pub mod sqlite_store;

pub use csv_search_core::{columns, ingest, models, record, search, store, vector};
pub use csv_search_core::{EmbeddingProvider, Error, Result};
