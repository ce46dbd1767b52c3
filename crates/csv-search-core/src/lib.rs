//! # csv-search core
//!
//! Storage-agnostic logic for csv-search: the vector codec, column
//! resolution, row parsing and fingerprints, the store abstraction, the
//! ingestion pipeline and ranked retrieval.
//!
//! This crate contains no sqlx, HTTP or filesystem I/O. The embedding
//! model is an injected [`EmbeddingProvider`]; the backing store is an
//! injected [`Store`](store::Store).

pub mod columns;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod models;
pub mod record;
pub mod search;
pub mod store;
pub mod vector;

pub use embedding::{EmbeddingProvider, SerializedProvider};
pub use error::{Error, Result};
