//! Index build: read, chunk, embed, summarise, persist

use super::lease::Lease;
use super::record::{remove_if_exists, CacheLayout, CacheRecord, SummariesFile};
use crate::config::IndexingConfig;
use crate::document::{chunk_text, lead_summary, DocumentKind, DocumentLoader, FileStat, ProjectLayout, Summary};
use crate::embedding::Embedder;
use crate::error::DhfError;
use crate::fingerprint::fingerprint_stats;
use crate::store::{content_hash, Chunk, ChunkId, ChunkMetadata, VectorStore};
use std::path::Path;

/// Result of a build, not yet persisted
pub struct BuiltIndex {
    pub store: VectorStore,
    pub summaries: Vec<Summary>,
    pub file_count: usize,
    pub reused_embeddings: usize,
}

impl BuiltIndex {
    /// Fingerprint of the files that made it into the store
    pub fn store_fingerprint(&self) -> &str {
        self.store.fingerprint()
    }
}

pub struct IndexBuilder<'a> {
    pub layout: &'a ProjectLayout,
    pub indexing: &'a IndexingConfig,
    pub loader: &'a dyn DocumentLoader,
    pub embedder: &'a dyn Embedder,
}

/// A file that produced text, with its chunks
struct LoadedDocument {
    stat: FileStat,
    category: String,
    subcategory: String,
    chunks: Vec<String>,
}

impl IndexBuilder<'_> {
    /// Build a fresh store for `project`.
    ///
    /// Files are visited in relative-path order and chunks by index, so the
    /// store's insertion order is deterministic. Embeddings from `previous`
    /// are reused for chunks whose content hash is unchanged. Unreadable or
    /// unsupported files are skipped; an embedding failure aborts the build.
    pub fn build(
        &self,
        project: &Path,
        previous: Option<&VectorStore>,
        lease: Option<&Lease>,
    ) -> crate::Result<BuiltIndex> {
        // Everything under the roots except the prompt folder; on-demand
        // categories are indexed and filtered at retrieval time.
        let excludes = self.layout.fingerprint_excludes(true);
        let mut files = self.loader.list_files(project, &self.layout.roots(), &excludes)?;
        // The store is ordered by path, whatever order the loader reports
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files.dedup_by(|a, b| a.relative_path == b.relative_path);

        let reusable = previous
            .filter(|p| p.model_id() == self.embedder.model_id() && p.dimension() == self.embedder.dimension())
            .map(|p| p.embeddings_by_content_hash())
            .unwrap_or_default();

        let mut documents = Vec::new();
        let mut summaries = Vec::new();
        for stat in files {
            let Some(class) = self.layout.classify(&stat.relative_path) else {
                continue;
            };
            if class.kind == DocumentKind::Prompt {
                continue;
            }
            let text = match self.loader.read_text(&stat.path) {
                Ok(text) => text,
                Err(DhfError::Unsupported(path)) => {
                    tracing::debug!(path = %path.display(), "no text extractor, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %stat.relative_path, error = %e, "failed to read document, skipping");
                    continue;
                }
            };

            let summary = lead_summary(&text, self.indexing.summary_chars);
            if !summary.is_empty() {
                summaries.push(Summary {
                    file_name: stat.file_name().to_string(),
                    relative_path: stat.relative_path.clone(),
                    category: class.category.clone(),
                    subcategory: class.subcategory.clone(),
                    text: summary,
                });
            }
            documents.push(LoadedDocument {
                chunks: chunk_text(&text, self.indexing.chunk_chars, self.indexing.chunk_overlap),
                stat,
                category: class.category,
                subcategory: class.subcategory,
            });
        }

        let stats: Vec<FileStat> = documents.iter().map(|d| d.stat.clone()).collect();
        let mut store = VectorStore::new(
            fingerprint_stats(&stats),
            super::record::now_rfc3339(),
            self.embedder.model_id(),
            self.embedder.dimension(),
        );

        let mut reused_embeddings = 0;
        for doc in &documents {
            if let Some(lease) = lease {
                lease.heartbeat()?;
            }

            let hashes: Vec<String> = doc.chunks.iter().map(|c| content_hash(c)).collect();
            let missing: Vec<String> = doc
                .chunks
                .iter()
                .zip(&hashes)
                .filter(|(_, h)| !reusable.contains_key(h.as_str()))
                .map(|(c, _)| c.clone())
                .collect();
            let mut fresh = self.embedder.embed_batch(&missing)?.into_iter();

            for (index, (content, hash)) in doc.chunks.iter().zip(hashes).enumerate() {
                let embedding = match reusable.get(hash.as_str()) {
                    Some(v) => {
                        reused_embeddings += 1;
                        v.to_vec()
                    }
                    None => fresh.next().ok_or_else(|| {
                        DhfError::Embedding(format!(
                            "embedder returned too few vectors for {}",
                            doc.stat.relative_path
                        ))
                    })?,
                };
                store.add_entry(Chunk {
                    id: ChunkId::new(&doc.stat.relative_path, index),
                    embedding,
                    metadata: ChunkMetadata {
                        file_name: doc.stat.file_name().to_string(),
                        relative_path: doc.stat.relative_path.clone(),
                        category: doc.category.clone(),
                        subcategory: doc.subcategory.clone(),
                        chunk_index: index,
                        content: content.clone(),
                        content_hash: hash,
                    },
                })?;
            }
        }

        Ok(BuiltIndex {
            store,
            summaries,
            file_count: documents.len(),
            reused_embeddings,
        })
    }
}

/// Write the store and summaries of `record.generation`, then commit the
/// record. Until the record is renamed into place the previous record and
/// its generation stay valid; older generations are removed only after.
pub fn persist(layout: &CacheLayout, built: &BuiltIndex, record: &CacheRecord) -> crate::Result<()> {
    built.store.save(&layout.store_path(&record.generation))?;
    SummariesFile {
        fingerprint: built.store_fingerprint().to_string(),
        summaries: built.summaries.clone(),
    }
    .save(&layout.summaries_path(&record.generation))?;
    record.save(&layout.record_path())?;

    for stale in layout.other_generations(Some(&record.generation)) {
        if let Err(e) = remove_if_exists(&stale) {
            tracing::warn!(path = %stale.display(), error = %e, "failed to remove old cache generation");
        }
    }
    Ok(())
}
