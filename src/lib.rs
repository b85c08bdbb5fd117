//! # Synapse Core
//!
//! **A multi-tenant knowledge-ingestion and hybrid-retrieval core.**
//!
//! Synapse Core ingests normalized documents from external collaborators
//! (mail sync, drive sync, accounting sync, ...), fans each one out into a
//! vector store (chunks + embeddings) and a typed property graph (entities +
//! relations), keeps the two in sync under continuous ingestion, and serves
//! them through a time-aware hybrid query engine. One SQLite database backs
//! every store behind logically separate table sets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌───────────────────┐
//! │ DocumentRecord│──▶│    ingest::*        │──▶│      SQLite        │
//! │ (external)    │   │ chunk/embed/extract │   │ vector + graph +   │
//! └──────────────┘   │ /validate/upsert     │   │ docstore + jobs    │
//!                     └────────────────────┘   └─────────┬──────────┘
//!                                                          │
//!                      ┌───────────────────────────────────┤
//!                      ▼                                   ▼
//!                 ┌──────────┐                       ┌──────────┐
//!                 │   CLI    │                       │ scheduler │
//!                 │(synapse) │                       │  + dedup  │
//!                 └──────────┘                       └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A [`models::DocumentRecord`] enters [`ingest::ingest_document`] (or
//!    [`ingest::ingest_batch`] for many at once).
//! 2. It is deduplicated by content hash ([`docstore`]), chunked
//!    ([`chunk`]), embedded ([`embedding`]), and its chunks/vectors are
//!    written to the vector store ([`vectorstore`]).
//! 3. Each chunk is passed through the schema-guided extractor
//!    ([`extract`]) and the relationship validator ([`validator`]) before
//!    its entities/relations land in the graph store ([`graph`]).
//! 4. [`dedup`] periodically (or on demand, via [`scheduler`]) merges
//!    near-duplicate entities.
//! 5. [`query`] answers questions by blending vector retrieval (with
//!    recency boost and optional [`rerank`]) and graph retrieval, routed
//!    through time extraction and, for multi-part questions, decomposition.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types flowing through the pipeline |
//! | [`errors`] | Error taxonomy (`CoreError`) |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`chunk`] | Recursive-separator text chunker |
//! | [`embedding`] | Embedding provider trait, OpenAI implementation, cache |
//! | [`llm`] | Chat-completion provider trait, OpenAI implementation |
//! | [`docstore`] | Document metadata store |
//! | [`vectorstore`] | Chunk/vector storage and filtered nearest-neighbour search |
//! | [`graph`] | Entity/relation/chunk-node storage and graph traversal |
//! | [`extract`] | Schema-guided entity/relation extractor |
//! | [`validator`] | Relationship validator |
//! | [`dedup`] | Entity deduplication engine |
//! | [`rerank`] | Cross-encoder reranker seam |
//! | [`retry`] | Generic exponential-backoff retry decorator |
//! | [`ingest`] | Ingestion pipeline orchestration |
//! | [`query`] | Hybrid query engine (time-aware retrieval + synthesis) |
//! | [`scheduler`] | Job queue, distributed lock, periodic dedup, backfill |
//! | [`get`] | Document retrieval by id |
//! | [`stats`] | Corpus/store statistics |
//!
//! ## Configuration
//!
//! Synapse Core is configured via a TOML file. See [`config`] for all
//! available options and [`config::load_config`] for validation rules.

pub mod chunk;
pub mod config;
pub mod db;
pub mod dedup;
pub mod docstore;
pub mod embedding;
pub mod errors;
pub mod extract;
pub mod get;
pub mod graph;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod query;
pub mod rerank;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod validator;
pub mod vectorstore;
