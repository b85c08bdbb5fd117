//! Core data models flowing through the ingestion and retrieval pipeline.
//!
//! These types mirror the data model in §3 of the specification: a
//! [`DocumentRecord`] enters the pipeline and fans out into [`Chunk`]s (owned
//! by the vector store) and [`Entity`]/[`Relation`]/[`ChunkNode`] values
//! (owned by the graph store), correlated by `document_id`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum content length accepted by the pipeline; longer content is
/// truncated rather than rejected (§3, §8 boundary behaviour).
pub const MAX_CONTENT_CHARS: usize = 100_000;

/// A normalized document handed to the core by an external collaborator
/// (connector, mail sync, drive sync, accounting sync, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub tenant_id: String,
    pub source: String,
    pub source_id: String,
    pub document_type: String,
    pub title: String,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Document-type-specific structured fields (sender, recipients, ...).
    /// Flows into the extractor's context and into graph sanitisation, never
    /// onto entity properties.
    #[serde(default)]
    pub fields: HashMap<String, Value>,
    /// Set when this record is an attachment whose timestamp should be
    /// inherited from a parent document if `created_at` is absent.
    #[serde(default)]
    pub parent_doc_id: Option<String>,
}

impl DocumentRecord {
    /// Strips null bytes and caps content to [`MAX_CONTENT_CHARS`], per §3.
    pub fn normalized_content(&self) -> String {
        let stripped: String = self.content.chars().filter(|&c| c != '\0').collect();
        if stripped.chars().count() > MAX_CONTENT_CHARS {
            stripped.chars().take(MAX_CONTENT_CHARS).collect()
        } else {
            stripped
        }
    }

    /// Stable content hash used for duplicate suppression (§4.4 step 2).
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.tenant_id.as_bytes());
        hasher.update(self.source.as_bytes());
        hasher.update(self.source_id.as_bytes());
        hasher.update(self.normalized_content().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A contiguous substring of a document's content, sized for embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub tenant_id: String,
    pub source: String,
    pub document_type: String,
    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Sole carrier of temporal information for entity-oriented queries
    /// (§3, invariant 4: must agree with `created_at`).
    pub created_at_timestamp: Option<i64>,
}

impl Chunk {
    pub fn text_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A typed node in the graph representing a real-world entity.
///
/// Entities are context-free: no document-specific properties, no
/// timestamps (§3). `entity_id` is derived from `(label, name)` so that
/// repeated mentions across documents resolve to the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub label: String,
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Populated only during dedup bookkeeping; entities otherwise carry no
    /// timestamp (§3). `None` marks a "legacy" entity for dedup purposes.
    #[serde(default)]
    pub created_at_timestamp: Option<i64>,
}

impl Entity {
    /// Deterministic id derived from name+type (§3).
    pub fn derive_id(label: &str, name: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(label.to_ascii_uppercase().as_bytes());
        hasher.update(b"::");
        hasher.update(name.trim().to_ascii_lowercase().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Text embedded to produce the entity's vector: `"{label}: {name}"`.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.label, self.name)
    }
}

/// A typed, directed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub source_id: String,
    pub source_label: String,
    pub relation_label: String,
    pub target_id: String,
    pub target_label: String,
}

/// A candidate triple proposed by the extractor, before schema validation.
#[derive(Debug, Clone)]
pub struct CandidateTriple {
    pub source_label: String,
    pub source_name: String,
    pub relation_label: String,
    pub target_label: String,
    pub target_name: String,
}

/// A graph node representing a single chunk, for provenance and
/// entity-oriented temporal queries (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkNode {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub title: String,
    pub source: String,
    pub document_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub created_at_timestamp: Option<i64>,
}

/// A search result surfaced to consumers of the hybrid query engine.
///
/// Callers must deduplicate by `(source, document_id)` themselves (§4.6
/// retrieval contract); the engine returns the raw union of retrieved nodes.
#[derive(Debug, Clone, Serialize)]
pub struct SourceNode {
    pub document_id: String,
    pub title: String,
    pub source: String,
    pub document_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub excerpt: String,
    pub score: f64,
    pub origin: RetrievalOrigin,
}

/// Which retriever produced a given [`SourceNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalOrigin {
    Vector,
    Graph,
}

/// Outcome of a single document's ingestion.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    PartialSuccess,
    Skipped,
    Error,
}

/// Result of `ingest_document`/`ingest_batch` for a single document (§6).
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub document_id: String,
    pub chunks_written: usize,
    pub entities_written: usize,
    pub relations_written: usize,
    pub error: Option<String>,
}
