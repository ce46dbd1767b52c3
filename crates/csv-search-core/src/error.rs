//! Error taxonomy shared by every csv-search component.
//!
//! Each variant corresponds to one failure class with its own propagation
//! rule (see the ingestion pipeline and the query surface for how they are
//! surfaced). Front-ends translate these into exit codes or HTTP statuses.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Unresolvable or missing required column, or an invalid option.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A single input row could not be turned into a record.
    #[error("row {row}: {message}")]
    Record { row: u64, message: String },

    /// The embedding collaborator failed to produce a vector.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Schema creation or migration failed.
    #[error("schema error: {0}")]
    Schema(String),

    /// Any other failure of the underlying store.
    #[error("storage error: {0}")]
    Storage(String),

    /// Stored bytes could not be decoded.
    #[error("format error: {0}")]
    Format(String),

    /// A deadline expired before the operation finished.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Caller-supplied query input is unusable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn record(row: u64, msg: impl Into<String>) -> Self {
        Error::Record {
            row,
            message: msg.into(),
        }
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Error::Encoding(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    /// Short machine-readable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Record { .. } => "record",
            Error::Encoding(_) => "encoding",
            Error::Schema(_) => "schema",
            Error::Storage(_) => "storage",
            Error::Format(_) => "format",
            Error::Timeout(_) => "timeout",
            Error::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Only deadline expiry is worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
