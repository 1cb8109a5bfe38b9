//! DHF RAG Core - Context retrieval for regulatory document generation
//!
//! This library maintains a fingerprint-validated embedding index per
//! project, rebuilt at most once at a time across threads and processes,
//! and assembles token-budgeted context for Design History File prompts.

pub mod assemble;
pub mod cache;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod policy;
pub mod reference;
pub mod store;
pub mod tokens;

pub use assemble::{ContextAssembler, ContextPackage, RankedChunk, RetrievalOptions};
pub use cache::{CacheManager, CacheRecord, CacheStatus, ProjectIndex};
pub use config::Config;
pub use document::{CategoryKey, DocumentLoader, FileStat, FsDocumentLoader, ProjectLayout, Summary};
pub use embedding::{Embedder, HashingEmbedder};
pub use error::{DhfError, ErrorEnvelope};
pub use fingerprint::{compute_fingerprint, fingerprint_stats};
pub use policy::{Categorized, RetrievalPolicy};
pub use reference::{Reference, ReferenceSet};
pub use store::{CategoryFilter, Chunk, ChunkId, VectorStore};
pub use tokens::TokenEstimator;

/// Result type alias for dhf-rag operations
pub type Result<T> = std::result::Result<T, DhfError>;
