//! Project index cache
//!
//! `CacheManager` keeps one [`ProjectIndex`] per project, valid while the
//! project's fingerprint matches the one recorded when it was built. Stale
//! or missing indexes are rebuilt at most once at a time per project: in
//! process through a single-flight registry, across processes through a
//! lease file.

mod builder;
mod lease;
mod record;

pub use builder::{persist, BuiltIndex, IndexBuilder};
pub use lease::{new_owner_id, Lease};
pub use record::{new_generation, write_atomic, CacheLayout, CacheRecord, SummariesFile, SCHEMA_VERSION};

use crate::assemble::{ContextAssembler, ContextPackage, RetrievalOptions};
use crate::config::Config;
use crate::document::{CategoryKey, DocumentLoader, FsDocumentLoader, ProjectLayout, Summary};
use crate::embedding::{self, Embedder};
use crate::error::DhfError;
use crate::fingerprint::compute_fingerprint;
use crate::policy::RetrievalPolicy;
use crate::reference::ReferenceSet;
use crate::store::VectorStore;
use crate::tokens::TokenEstimator;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{watch, RwLock};

/// A loaded, valid index for one project. Shared read-only; a rebuild
/// replaces the whole `Arc`.
#[derive(Debug)]
pub struct ProjectIndex {
    pub record: CacheRecord,
    pub store: VectorStore,
    pub summaries: Vec<Summary>,
}

impl ProjectIndex {
    /// Categories a bare `[Category|...]` directive may name
    fn known_categories(&self, layout: &ProjectLayout) -> Vec<CategoryKey> {
        let mut keys: Vec<CategoryKey> = layout.on_demand().to_vec();
        let indexed = self
            .summaries
            .iter()
            .map(|s| s.category.as_str())
            .chain(self.store.entries().iter().map(|c| c.metadata.category.as_str()));
        for category in indexed {
            let key = CategoryKey::new(category);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// Cache state of one project, without triggering a rebuild
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub project: PathBuf,
    pub cache_dir: PathBuf,
    pub current_fingerprint: String,
    pub record: Option<CacheRecord>,
    /// Record matches the current fingerprint and embedder
    pub valid: bool,
    pub in_memory: bool,
    pub rebuilding: bool,
}

type BuildOutcome = Result<Arc<ProjectIndex>, Arc<DhfError>>;

struct Inner {
    config: Config,
    layout: ProjectLayout,
    loader: Arc<dyn DocumentLoader>,
    embedder: Arc<dyn Embedder>,
    policy: RetrievalPolicy,
    estimator: TokenEstimator,
    cache_root: PathBuf,
    owner_id: String,
    indexes: RwLock<HashMap<String, Arc<ProjectIndex>>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<BuildOutcome>>>>,
    rebuilds: AtomicUsize,
}

/// Entry point for index maintenance and context retrieval. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl CacheManager {
    /// Manager with the filesystem loader and the configured embedder.
    pub fn new(config: Config) -> crate::Result<Self> {
        let loader = Arc::new(FsDocumentLoader::new(&config.indexing)?);
        let embedder = embedding::from_config(&config.embedding)?;
        Ok(Self::with_components(config, loader, embedder))
    }

    pub fn with_components(
        config: Config,
        loader: Arc<dyn DocumentLoader>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let layout = ProjectLayout::new(&config.layout);
        let policy = RetrievalPolicy::new(layout.on_demand().iter().cloned());
        let estimator = TokenEstimator::from_config(&config.assembly);
        Self {
            inner: Arc::new(Inner {
                cache_root: config.cache_root(),
                owner_id: new_owner_id(),
                layout,
                loader,
                embedder,
                policy,
                estimator,
                config,
                indexes: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                rebuilds: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of full rebuilds this manager has run.
    pub fn rebuild_count(&self) -> usize {
        self.inner.rebuilds.load(Ordering::SeqCst)
    }

    /// Current fingerprint of a project's tracked files.
    pub async fn fingerprint(&self, project: &Path) -> crate::Result<String> {
        let inner = Arc::clone(&self.inner);
        let project = project.to_path_buf();
        run_blocking(move || inner.fingerprint(&project)).await
    }

    /// Return a valid index for `project`, rebuilding it if needed.
    ///
    /// Concurrent callers for the same project share one rebuild. The
    /// rebuild runs on its own task and completes even if every caller
    /// stops waiting.
    pub async fn ensure_index_ready(&self, project: &Path) -> crate::Result<Arc<ProjectIndex>> {
        let (layout, fingerprint) = {
            let inner = Arc::clone(&self.inner);
            let project = project.to_path_buf();
            run_blocking(move || {
                let layout = CacheLayout::new(&inner.cache_root, &project)?;
                let fingerprint = inner.fingerprint(layout.project())?;
                Ok((layout, fingerprint))
            })
            .await?
        };
        let key = layout.key().to_string();

        if let Some(index) = self.cached(&key, &fingerprint).await {
            tracing::debug!(project = %layout.project().display(), "index cache hit");
            return Ok(index);
        }

        let mut rx = self.join_or_lead(layout.clone(), key, fingerprint);
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| rebuild_aborted(layout.project()))?
            .clone();

        match outcome {
            Some(Ok(index)) => Ok(index),
            Some(Err(source)) => Err(DhfError::CacheBuild {
                project: layout.project().to_path_buf(),
                source,
            }),
            None => Err(rebuild_aborted(layout.project())),
        }
    }

    /// Ensure the index, then assemble a bounded context package for `prompt`.
    pub async fn retrieve_context(
        &self,
        project: &Path,
        prompt: &str,
        options: &RetrievalOptions,
    ) -> crate::Result<ContextPackage> {
        let index = self.ensure_index_ready(project).await?;
        let inner = Arc::clone(&self.inner);
        let prompt = prompt.to_string();
        let options = options.clone();

        run_blocking(move || {
            let known = index.known_categories(&inner.layout);
            let refs = ReferenceSet::from_prompt(&prompt, &known);
            let query = inner.embedder.embed(&prompt)?;
            let assembler = ContextAssembler::new(
                &inner.config.assembly.instructions,
                inner.layout.procedures_dir(),
                &inner.policy,
                &inner.estimator,
            );
            let package = assembler.assemble(&index.store, &index.summaries, &query, &refs, &options);
            tracing::debug!(
                procedures = package.ranked_procedure_chunks.len(),
                context = package.ranked_context_chunks.len(),
                tokens = package.estimated_tokens,
                "context assembled"
            );
            Ok(package)
        })
        .await
    }

    /// Drop a project's persisted cache and in-memory index.
    ///
    /// Takes the rebuild lease, so it waits for any rebuild in progress.
    pub async fn clear(&self, project: &Path) -> crate::Result<()> {
        let inner = Arc::clone(&self.inner);
        let project = project.to_path_buf();
        let key = run_blocking(move || {
            let layout = CacheLayout::new(&inner.cache_root, &project)?;
            let _lease = inner.lease(&layout)?;
            // Record first: without it the remaining files are never trusted
            record::remove_if_exists(&layout.record_path())?;
            for path in layout.other_generations(None) {
                record::remove_if_exists(&path)?;
            }
            let _ = std::fs::remove_dir(layout.dir());
            tracing::info!(project = %layout.project().display(), "cache cleared");
            Ok(layout.key().to_string())
        })
        .await?;

        self.inner.indexes.write().await.remove(&key);
        Ok(())
    }

    /// Report cache state without rebuilding.
    pub async fn status(&self, project: &Path) -> crate::Result<CacheStatus> {
        let inner = Arc::clone(&self.inner);
        let project = project.to_path_buf();
        let (layout, current_fingerprint, record) = run_blocking(move || {
            let layout = CacheLayout::new(&inner.cache_root, &project)?;
            let fingerprint = inner.fingerprint(layout.project())?;
            let record = match CacheRecord::load(&layout.record_path()) {
                Ok(record) => record,
                Err(e @ DhfError::CorruptCache { .. }) => {
                    tracing::warn!(error = %e, "ignoring unreadable cache record");
                    None
                }
                Err(e) => return Err(e),
            };
            Ok((layout, fingerprint, record))
        })
        .await?;

        let valid = record.as_ref().is_some_and(|r| {
            r.fingerprint == current_fingerprint && r.model_id == self.inner.embedder.model_id()
        });
        let in_memory = self.cached(layout.key(), &current_fingerprint).await.is_some();
        let rebuilding = self
            .inner
            .in_flight
            .lock()
            .map(|m| m.contains_key(layout.key()))
            .unwrap_or(false);

        Ok(CacheStatus {
            project: layout.project().to_path_buf(),
            cache_dir: layout.dir().to_path_buf(),
            current_fingerprint,
            record,
            valid,
            in_memory,
            rebuilding,
        })
    }

    async fn cached(&self, key: &str, fingerprint: &str) -> Option<Arc<ProjectIndex>> {
        let indexes = self.inner.indexes.read().await;
        indexes
            .get(key)
            .filter(|index| index.record.fingerprint == fingerprint)
            .map(Arc::clone)
    }

    /// Attach to the in-flight rebuild for `key`, or start one.
    fn join_or_lead(
        &self,
        layout: CacheLayout,
        key: String,
        fingerprint: String,
    ) -> watch::Receiver<Option<BuildOutcome>> {
        let mut in_flight = match self.inner.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(rx) = in_flight.get(&key) {
            tracing::debug!(project = %layout.project().display(), "joining in-flight rebuild");
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.clone(), rx.clone());
        drop(in_flight);

        let slot = InFlightSlot {
            inner: Arc::clone(&self.inner),
            key,
            project: layout.project().to_path_buf(),
            tx: Some(tx),
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.refresh(layout, fingerprint).await;
            slot.finish(outcome);
        });
        rx
    }
}

impl Inner {
    fn fingerprint(&self, project: &Path) -> crate::Result<String> {
        compute_fingerprint(
            self.loader.as_ref(),
            project,
            &self.layout,
            self.config.fingerprint.track_on_demand,
        )
    }

    fn lease(&self, layout: &CacheLayout) -> crate::Result<Lease> {
        Lease::acquire(
            layout.lease_path(),
            &self.owner_id,
            self.config.lease_ttl(),
            self.config.lock_timeout(),
            layout.project(),
        )
    }

    /// Load from disk or rebuild, then publish into the memory map.
    async fn refresh(self: &Arc<Self>, layout: CacheLayout, fingerprint: String) -> BuildOutcome {
        let previous = self.indexes.read().await.get(layout.key()).cloned();
        let inner = Arc::clone(self);
        let key = layout.key().to_string();

        let index = run_blocking(move || inner.load_or_build(&layout, &fingerprint, previous))
            .await
            .map_err(Arc::new)?;

        self.indexes.write().await.insert(key, Arc::clone(&index));
        Ok(index)
    }

    fn load_or_build(
        &self,
        layout: &CacheLayout,
        fingerprint: &str,
        previous: Option<Arc<ProjectIndex>>,
    ) -> crate::Result<Arc<ProjectIndex>> {
        if let Some(index) = self.load_valid(layout, fingerprint) {
            return Ok(Arc::new(index));
        }

        let lease = self.lease(layout)?;

        // Another process may have finished while we waited for the lease
        let fingerprint = self.fingerprint(layout.project())?;
        if let Some(index) = self.load_valid(layout, &fingerprint) {
            tracing::debug!(project = %layout.project().display(), "index rebuilt elsewhere");
            return Ok(Arc::new(index));
        }

        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        tracing::info!(project = %layout.project().display(), "rebuilding index");

        let previous = previous.or_else(|| self.load_any(layout).map(Arc::new));
        let built = IndexBuilder {
            layout: &self.layout,
            indexing: &self.config.indexing,
            loader: self.loader.as_ref(),
            embedder: self.embedder.as_ref(),
        }
        .build(
            layout.project(),
            previous.as_ref().map(|p| &p.store),
            Some(&lease),
        )?;

        let record = CacheRecord {
            schema_version: SCHEMA_VERSION,
            generation: new_generation(),
            project_path: layout.project().to_string_lossy().to_string(),
            fingerprint,
            vector_store_fingerprint: built.store_fingerprint().to_string(),
            indexed_at: record::now_rfc3339(),
            model_id: self.embedder.model_id().to_string(),
            chunk_count: built.store.len(),
            file_count: built.file_count,
        };
        persist(layout, &built, &record)?;
        drop(lease);

        tracing::info!(
            project = %layout.project().display(),
            files = built.file_count,
            chunks = built.store.len(),
            reused = built.reused_embeddings,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index rebuilt"
        );
        Ok(Arc::new(ProjectIndex {
            record,
            store: built.store,
            summaries: built.summaries,
        }))
    }

    /// The persisted index, if it is complete and matches `fingerprint`.
    ///
    /// Any read or consistency problem is a miss.
    fn load_valid(&self, layout: &CacheLayout, fingerprint: &str) -> Option<ProjectIndex> {
        let record = match CacheRecord::load(&layout.record_path()) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "cache record unusable, rebuilding");
                return None;
            }
        };
        if record.fingerprint != fingerprint || record.model_id != self.embedder.model_id() {
            return None;
        }

        let index = self.load_files(layout, record);
        if index.is_none() {
            tracing::warn!(project = %layout.project().display(), "persisted index incomplete, rebuilding");
        }
        index
    }

    /// The persisted index regardless of fingerprint, for embedding reuse.
    fn load_any(&self, layout: &CacheLayout) -> Option<ProjectIndex> {
        let record = CacheRecord::load(&layout.record_path()).ok().flatten()?;
        self.load_files(layout, record)
    }

    fn load_files(&self, layout: &CacheLayout, record: CacheRecord) -> Option<ProjectIndex> {
        let store = VectorStore::load(&layout.store_path(&record.generation), self.embedder.dimension())
            .map_err(|e| tracing::warn!(error = %e, "vector store unusable"))
            .ok()?;
        let summaries = SummariesFile::load(&layout.summaries_path(&record.generation))
            .map_err(|e| tracing::warn!(error = %e, "summaries unusable"))
            .ok()?;

        let consistent = store.model_id() == record.model_id
            && store.fingerprint() == record.vector_store_fingerprint
            && summaries.fingerprint == record.vector_store_fingerprint;
        consistent.then(|| ProjectIndex {
            record,
            store,
            summaries: summaries.summaries,
        })
    }
}

/// Registry entry owned by the task running a rebuild. Removes itself and
/// publishes to waiters when finished or dropped.
struct InFlightSlot {
    inner: Arc<Inner>,
    key: String,
    project: PathBuf,
    tx: Option<watch::Sender<Option<BuildOutcome>>>,
}

impl InFlightSlot {
    fn finish(mut self, outcome: BuildOutcome) {
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: BuildOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        match self.inner.in_flight.lock() {
            Ok(mut map) => {
                map.remove(&self.key);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.key);
            }
        }
        if let Err(e) = &outcome {
            tracing::warn!(project = %self.project.display(), error = %e, "index rebuild failed");
        }
        tx.send_replace(Some(outcome));
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let err = rebuild_aborted(&self.project);
            self.publish(Err(Arc::new(err)));
        }
    }
}

fn rebuild_aborted(project: &Path) -> DhfError {
    DhfError::io_at(project, io::Error::other("index rebuild task ended without a result"))
}

async fn run_blocking<T, F>(f: F) -> crate::Result<T>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DhfError::Io(io::Error::other(format!("blocking task failed: {err}"))))?
}
