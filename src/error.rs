//! Error taxonomy for the ingestion and answer pipelines.
//!
//! Per-file problems ([`KbError::Ingestion`]) are absorbed and logged by the
//! ingestion workflow. Everything else propagates to the caller of the
//! operation that failed.

use thiserror::Error;

/// Errors surfaced by the knowledge base core.
#[derive(Debug, Error)]
pub enum KbError {
    /// Extraction, hashing, or embedding failed for a single file.
    #[error("ingestion failed for {path}: {message}")]
    Ingestion { path: String, message: String },

    /// No persisted index exists and no chunks were supplied to create one.
    #[error("knowledge index is empty: {0}")]
    EmptyIndex(String),

    /// Embedding the query or searching the index failed.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The generation service failed, before or during streaming.
    #[error("generation failed: {0}")]
    Generation(String),

    /// A stored vector and a new vector disagree on dimensionality.
    #[error("vector dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Caller supplied an unusable argument (empty question, bad filename, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KbError {
    pub fn ingestion(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        KbError::Ingestion {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Machine-readable code used by the HTTP error body.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::Ingestion { .. } => "ingestion_error",
            KbError::EmptyIndex(_) => "empty_index",
            KbError::Retrieval(_) => "retrieval_error",
            KbError::Generation(_) => "generation_error",
            KbError::DimensionMismatch { .. } => "dimension_mismatch",
            KbError::InvalidInput(_) => "bad_request",
            KbError::Config(_) => "config_error",
            KbError::Database(_) | KbError::Io(_) | KbError::Serialization(_) => "internal",
        }
    }
}

pub type Result<T, E = KbError> = std::result::Result<T, E>;
