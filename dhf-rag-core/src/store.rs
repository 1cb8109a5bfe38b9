//! Vector store: embedded chunks, cosine search, persistence

use crate::cache::write_atomic;
use crate::document::CategoryKey;
use crate::error::DhfError;
use crate::policy::Categorized;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::Path;

/// Stable chunk id: hash of (relative_path, chunk_index).
///
/// Survives rebuilds as long as the file keeps its path and chunk position,
/// and serves as the similarity tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(relative_path: &str, chunk_index: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{relative_path}#{chunk_index}").as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// SHA-256 hex of chunk content
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub file_name: String,
    pub relative_path: String,
    pub category: String,
    pub subcategory: String,
    pub chunk_index: usize,
    pub content: String,
    pub content_hash: String,
}

/// An embedded span of a source document. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl Categorized for Chunk {
    fn category(&self) -> &str {
        &self.metadata.category
    }

    fn file_name(&self) -> &str {
        &self.metadata.file_name
    }
}

/// Restricts a search to (or away from) a set of categories.
#[derive(Debug, Clone)]
pub enum CategoryFilter {
    Include(Vec<CategoryKey>),
    Exclude(Vec<CategoryKey>),
}

impl CategoryFilter {
    pub fn include(categories: &[&str]) -> Self {
        Self::Include(categories.iter().map(|c| CategoryKey::new(c)).collect())
    }

    pub fn exclude(categories: &[&str]) -> Self {
        Self::Exclude(categories.iter().map(|c| CategoryKey::new(c)).collect())
    }

    pub fn matches(&self, category: &str) -> bool {
        let key = CategoryKey::new(category);
        match self {
            Self::Include(keys) => keys.contains(&key),
            Self::Exclude(keys) => !keys.contains(&key),
        }
    }
}

/// A search result borrowed from the store
#[derive(Debug, Clone, Copy)]
pub struct ScoredChunk<'a> {
    pub chunk: &'a Chunk,
    pub similarity: f32,
}

impl Categorized for ScoredChunk<'_> {
    fn category(&self) -> &str {
        self.chunk.category()
    }

    fn file_name(&self) -> &str {
        self.chunk.file_name()
    }
}

/// In-memory collection of embedded chunks for one project.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStore {
    fingerprint: String,
    created_at: String,
    model_id: String,
    dimension: usize,
    entries: Vec<Chunk>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreFileRef<'a> {
    fingerprint: &'a str,
    created_at: &'a str,
    model_id: &'a str,
    dimension: usize,
    entry_count: usize,
    entries: &'a [Chunk],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    fingerprint: String,
    created_at: String,
    model_id: String,
    dimension: usize,
    entry_count: usize,
    entries: Vec<Chunk>,
}

impl VectorStore {
    /// Create an empty store for a rebuild.
    pub fn new(
        fingerprint: impl Into<String>,
        created_at: impl Into<String>,
        model_id: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            created_at: created_at.into(),
            model_id: model_id.into(),
            dimension,
            entries: Vec::new(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn entries(&self) -> &[Chunk] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a chunk. Callers insert files in path order and chunks by index.
    pub fn add_entry(&mut self, chunk: Chunk) -> crate::Result<()> {
        if chunk.embedding.len() != self.dimension {
            return Err(DhfError::Embedding(format!(
                "chunk {} has dimension {}, store expects {}",
                chunk.id,
                chunk.embedding.len(),
                self.dimension
            )));
        }
        self.entries.push(chunk);
        Ok(())
    }

    /// Embeddings keyed by content hash, for reuse by the next rebuild.
    pub fn embeddings_by_content_hash(&self) -> HashMap<&str, &[f32]> {
        self.entries
            .iter()
            .map(|c| (c.metadata.content_hash.as_str(), c.embedding.as_slice()))
            .collect()
    }

    /// Rank chunks by cosine similarity to `query`, highest first.
    ///
    /// Ties break on chunk id so repeated queries return identical order.
    /// Chunks that score `-inf` (zero vectors on either side) are left out.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&CategoryFilter>,
    ) -> Vec<ScoredChunk<'_>> {
        if top_k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<ScoredChunk<'_>> = self
            .entries
            .iter()
            .filter(|c| filter.map_or(true, |f| f.matches(&c.metadata.category)))
            .map(|chunk| ScoredChunk {
                chunk,
                similarity: cosine_similarity(query, &chunk.embedding),
            })
            .filter(|s| s.similarity.is_finite())
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(top_k);
        scored
    }

    /// Persist atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let file = StoreFileRef {
            fingerprint: &self.fingerprint,
            created_at: &self.created_at,
            model_id: &self.model_id,
            dimension: self.dimension,
            entry_count: self.entries.len(),
            entries: &self.entries,
        };
        let bytes = serde_json::to_vec(&file)?;
        write_atomic(path, &bytes)
    }

    /// Load and validate a persisted store.
    ///
    /// Any structural problem is reported as `CorruptCache`; callers treat
    /// that as a cache miss.
    pub fn load(path: &Path, expected_dimension: usize) -> crate::Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| DhfError::io_at(path, e))?;
        let file: StoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| DhfError::corrupt(path, format!("invalid JSON: {e}")))?;

        if file.entry_count != file.entries.len() {
            return Err(DhfError::corrupt(
                path,
                format!(
                    "entry count {} does not match {} entries",
                    file.entry_count,
                    file.entries.len()
                ),
            ));
        }
        if file.dimension != expected_dimension {
            return Err(DhfError::corrupt(
                path,
                format!(
                    "dimension {} does not match embedder dimension {}",
                    file.dimension, expected_dimension
                ),
            ));
        }
        for chunk in &file.entries {
            if chunk.embedding.len() != file.dimension {
                return Err(DhfError::corrupt(
                    path,
                    format!(
                        "chunk {} has {} dimensions, expected {}",
                        chunk.id,
                        chunk.embedding.len(),
                        file.dimension
                    ),
                ));
            }
            if chunk.embedding.iter().any(|v| !v.is_finite()) {
                return Err(DhfError::corrupt(
                    path,
                    format!("chunk {} has non-finite values", chunk.id),
                ));
            }
        }
        let ordered = file.entries.windows(2).all(|w| {
            let (a, b) = (&w[0].metadata, &w[1].metadata);
            (a.relative_path.as_str(), a.chunk_index) < (b.relative_path.as_str(), b.chunk_index)
        });
        if !ordered {
            return Err(DhfError::corrupt(path, "entries are not in insertion order"));
        }

        Ok(Self {
            fingerprint: file.fingerprint,
            created_at: file.created_at,
            model_id: file.model_id,
            dimension: file.dimension,
            entries: file.entries,
        })
    }
}

/// Cosine similarity; `-inf` when either side is a zero vector or the
/// lengths differ.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.is_empty() || left.len() != right.len() {
        return f32::NEG_INFINITY;
    }
    let (dot, norm_left, norm_right) =
        left.iter()
            .zip(right.iter())
            .fold((0.0_f32, 0.0_f32, 0.0_f32), |acc, (l, r)| {
                let (dot, norm_left, norm_right) = acc;
                (dot + l * r, norm_left + l * l, norm_right + r * r)
            });
    if norm_left <= f32::EPSILON || norm_right <= f32::EPSILON {
        return f32::NEG_INFINITY;
    }
    dot / (norm_left.sqrt() * norm_right.sqrt())
}
