//! Error taxonomy (§7).
//!
//! Library-facing operations return [`CoreError`]; internal plumbing keeps
//! using `anyhow::Result` the way the teacher crate's connector/ingest code
//! does, and is converted at the pipeline boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Connection refused, read timeout, 429, 5xx from any external store or
    /// model. Already retried 3x with backoff by the time this surfaces.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Persistent failure to produce embeddings for a document.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// LLM returned unparseable output after retries; the chunk is still
    /// stored, only its entities/relations are skipped.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// A candidate relation was rejected by the validator. Expected path,
    /// not surfaced as an error to callers — kept here for completeness of
    /// the taxonomy and for internal logging call sites.
    #[error("relation rejected by validator")]
    Validation,

    /// Wall-clock limit hit on a job.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    /// Content hash matched a prior document for the same tenant; not an
    /// error, reported as `status=skipped`.
    #[error("duplicate content, skipped")]
    DuplicateSkipped,

    /// Missing required configuration, incompatible schema, or indexes that
    /// cannot be created. Callers should treat this as fatal at startup.
    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientNetwork(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
