use dhf_rag_core::cache::CacheLayout;
use dhf_rag_core::{
    CacheManager, Config, DhfError, Embedder, FsDocumentLoader, HashingEmbedder, RetrievalOptions,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::task::JoinSet;

const DIMENSION: usize = 128;

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

/// Project with procedures, regular and on-demand context, and a prompt file
fn create_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(
        root,
        "Procedures/Design Controls/design-review.txt",
        "Design reviews are held at each phase gate. Reviewers verify design inputs \
         against user needs and record action items in the design history file.",
    );
    write(
        root,
        "Procedures/Risk Management/risk-procedure.txt",
        "Risk management follows ISO 14971. Hazards are identified, risks estimated \
         and controls verified for effectiveness.",
    );
    write(
        root,
        "Context/Risk/fmea.txt",
        "The FMEA lists sterilization failure as a high severity hazard with \
         mitigations in packaging validation.",
    );
    write(
        root,
        "Context/General/notes.txt",
        "Sterilization vendor notes: ethylene oxide cycle parameters were agreed \
         with the contract sterilizer.",
    );
    write(root, "Context/Prompt/prompt.txt", "Write the risk management plan.");
    dir
}

fn config(cache_root: &Path) -> Config {
    let mut config = Config::default();
    config.cache.root = cache_root.to_string_lossy().to_string();
    config.cache.lock_timeout = "5s".to_string();
    config.embedding.dimension = DIMENSION;
    config
}

fn manager(cache_root: &Path) -> CacheManager {
    CacheManager::new(config(cache_root)).unwrap()
}

fn layout(cache_root: &Path, project: &Path) -> CacheLayout {
    CacheLayout::new(cache_root, project).unwrap()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Hashing embedder that counts batches and can be told to fail
struct TestEmbedder {
    inner: HashingEmbedder,
    calls: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl TestEmbedder {
    fn new(fail: bool, delay: Duration) -> Self {
        Self {
            inner: HashingEmbedder::new(DIMENSION),
            calls: AtomicUsize::new(0),
            fail,
            delay,
        }
    }
}

impl Embedder for TestEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> dhf_rag_core::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.fail {
            return Err(DhfError::Embedding("backend unavailable".to_string()));
        }
        self.inner.embed(text)
    }
}

fn manager_with(cache_root: &Path, embedder: Arc<TestEmbedder>) -> CacheManager {
    let config = config(cache_root);
    let loader = Arc::new(FsDocumentLoader::new(&config.indexing).unwrap());
    CacheManager::with_components(config, loader, embedder)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_rebuild() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let embedder = Arc::new(TestEmbedder::new(false, Duration::from_millis(20)));
    let manager = manager_with(cache.path(), Arc::clone(&embedder));

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let manager = manager.clone();
        let path: PathBuf = project.path().to_path_buf();
        tasks.spawn(async move { manager.ensure_index_ready(&path).await });
    }

    let mut fingerprints = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let index = joined.unwrap().unwrap();
        fingerprints.push(index.record.fingerprint.clone());
    }

    assert_eq!(fingerprints.len(), 8);
    assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(manager.rebuild_count(), 1);
    assert!(!layout(cache.path(), project.path()).lease_path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_managers_rebuild_once_through_the_lease() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    // Each manager has its own owner id and in-flight registry, like two processes
    let first = manager_with(
        cache.path(),
        Arc::new(TestEmbedder::new(false, Duration::from_millis(20))),
    );
    let second = manager_with(
        cache.path(),
        Arc::new(TestEmbedder::new(false, Duration::from_millis(20))),
    );

    let path = project.path().to_path_buf();
    let (a, b) = tokio::join!(
        first.ensure_index_ready(&path),
        second.ensure_index_ready(&path)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(first.rebuild_count() + second.rebuild_count(), 1);
    assert_eq!(a.record, b.record);
    assert!(!layout(cache.path(), project.path()).lease_path().exists());
}

#[tokio::test]
async fn valid_cache_is_reused_and_edits_invalidate() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let manager = manager(cache.path());

    let first = manager.ensure_index_ready(project.path()).await.unwrap();
    let again = manager.ensure_index_ready(project.path()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(manager.rebuild_count(), 1);

    // Prompt and on-demand edits leave the fingerprint alone
    write(project.path(), "Context/Prompt/prompt.txt", "Write the design plan instead.");
    write(project.path(), "Context/General/notes.txt", "Rewritten notes.");
    manager.ensure_index_ready(project.path()).await.unwrap();
    assert_eq!(manager.rebuild_count(), 1);

    write(project.path(), "Procedures/Design Controls/new-sop.txt", "Design transfer procedure.");
    let rebuilt = manager.ensure_index_ready(project.path()).await.unwrap();
    assert_eq!(manager.rebuild_count(), 2);
    assert_ne!(rebuilt.record.fingerprint, first.record.fingerprint);
    assert!(rebuilt
        .store
        .entries()
        .iter()
        .any(|c| c.metadata.file_name == "new-sop.txt"));
}

#[tokio::test]
async fn persisted_index_is_loaded_by_a_new_manager() {
    let project = create_project();
    let cache = TempDir::new().unwrap();

    let first = manager(cache.path());
    let built = first.ensure_index_ready(project.path()).await.unwrap();

    let second = manager(cache.path());
    let loaded = second.ensure_index_ready(project.path()).await.unwrap();
    assert_eq!(second.rebuild_count(), 0);
    assert_eq!(loaded.record, built.record);
    assert_eq!(loaded.store.entries(), built.store.entries());

    let status = second.status(project.path()).await.unwrap();
    assert!(status.valid);
    assert!(status.in_memory);
    assert!(!status.rebuilding);
}

#[tokio::test]
async fn corrupt_store_is_a_cache_miss() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let index = manager(cache.path())
        .ensure_index_ready(project.path())
        .await
        .unwrap();

    let store_path = layout(cache.path(), project.path()).store_path(&index.record.generation);
    fs::write(&store_path, b"{\"fingerprint\": \"trunc").unwrap();

    let fresh = manager(cache.path());
    let index = fresh.ensure_index_ready(project.path()).await.unwrap();
    assert_eq!(fresh.rebuild_count(), 1);
    assert!(!index.store.is_empty());
}

#[tokio::test]
async fn embedding_failure_keeps_previous_cache() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let good = manager(cache.path());
    let previous = good.ensure_index_ready(project.path()).await.unwrap();

    let record_path = layout(cache.path(), project.path()).record_path();
    let record_before = fs::read(&record_path).unwrap();

    write(project.path(), "Procedures/Design Controls/extra.txt", "Design verification summary.");
    let failing = Arc::new(TestEmbedder::new(true, Duration::ZERO));
    let broken = manager_with(cache.path(), Arc::clone(&failing));

    let err = broken.ensure_index_ready(project.path()).await.unwrap_err();
    assert!(matches!(err, DhfError::CacheBuild { .. }));
    assert!(err.is_retriable());
    assert_eq!(fs::read(&record_path).unwrap(), record_before);
    assert!(layout(cache.path(), project.path())
        .store_path(&previous.record.generation)
        .exists());

    // Guards were released: the next request tries again instead of hanging
    let calls = failing.calls.load(Ordering::SeqCst);
    assert!(broken.ensure_index_ready(project.path()).await.is_err());
    assert!(failing.calls.load(Ordering::SeqCst) > calls);
    assert!(!layout(cache.path(), project.path()).lease_path().exists());
}

#[tokio::test]
async fn stale_lease_does_not_block_rebuild() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let lease_path = layout(cache.path(), project.path()).lease_path().to_path_buf();
    fs::create_dir_all(lease_path.parent().unwrap()).unwrap();
    fs::write(&lease_path, br#"{"ownerId":"crashed-1","acquiredAt":0}"#).unwrap();

    let manager = manager(cache.path());
    manager.ensure_index_ready(project.path()).await.unwrap();
    assert_eq!(manager.rebuild_count(), 1);
    assert!(!lease_path.exists());
}

#[tokio::test]
async fn live_foreign_lease_times_out_as_retriable() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let lease_path = layout(cache.path(), project.path()).lease_path().to_path_buf();
    fs::create_dir_all(lease_path.parent().unwrap()).unwrap();
    let body = format!(r#"{{"ownerId":"busy-1","acquiredAt":{}}}"#, now_millis());
    fs::write(&lease_path, body).unwrap();

    let mut config = config(cache.path());
    config.cache.lock_timeout = "200ms".to_string();
    let manager = CacheManager::new(config).unwrap();

    let err = manager.ensure_index_ready(project.path()).await.unwrap_err();
    match &err {
        DhfError::CacheBuild { source, .. } => {
            assert!(matches!(source.as_ref(), DhfError::LockTimeout { .. }))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retriable());
    assert_eq!(manager.rebuild_count(), 0);
    assert!(lease_path.exists());
}

#[tokio::test]
async fn retrieval_is_deterministic_and_respects_policy() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let manager = manager(cache.path());
    let options = RetrievalOptions::default()
        .with_top_k(4, 4)
        .with_max_tokens(10_000);
    let prompt = "Summarise sterilization risk controls.";

    let a = manager.retrieve_context(project.path(), prompt, &options).await.unwrap();
    let b = manager.retrieve_context(project.path(), prompt, &options).await.unwrap();
    assert_eq!(a.sources, b.sources);
    assert_eq!(a.fragment, b.fragment);
    assert!(a.ranked_context_chunks.iter().all(|c| c.category != "General"));
    assert!(!a.sources.contains(&"notes.txt".to_string()));
    assert!(!a.sources.contains(&"prompt.txt".to_string()));

    let with_ref = manager
        .retrieve_context(project.path(), "Summarise sterilization. [General|notes.txt]", &options)
        .await
        .unwrap();
    assert!(with_ref
        .ranked_context_chunks
        .iter()
        .any(|c| c.file_name == "notes.txt"));
    assert_eq!(manager.rebuild_count(), 1);
}

#[tokio::test]
async fn retrieval_stays_within_token_budget() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let manager = manager(cache.path());
    let prompt = "Design review and risk management";

    let full = manager
        .retrieve_context(project.path(), prompt, &RetrievalOptions::default().with_top_k(4, 4).with_max_tokens(10_000))
        .await
        .unwrap();
    assert!(!full.ranked_procedure_chunks.is_empty());

    let budget = full.estimated_tokens - 1;
    let trimmed = manager
        .retrieve_context(project.path(), prompt, &RetrievalOptions::default().with_top_k(4, 4).with_max_tokens(budget))
        .await
        .unwrap();
    assert!(trimmed.estimated_tokens <= budget);
    assert!(!trimmed.over_budget);
    assert!(trimmed.fragment.contains("# Instructions"));
    assert_eq!(trimmed.summaries, full.summaries);

    let tiny = manager
        .retrieve_context(project.path(), prompt, &RetrievalOptions::default().with_top_k(4, 4).with_max_tokens(1))
        .await
        .unwrap();
    assert!(tiny.over_budget);
    assert!(tiny.ranked_procedure_chunks.is_empty() && tiny.ranked_context_chunks.is_empty());
    assert!(tiny.fragment.contains("# Instructions"));
}

#[tokio::test]
async fn clear_removes_persisted_index() {
    let project = create_project();
    let cache = TempDir::new().unwrap();
    let manager = manager(cache.path());
    let index = manager.ensure_index_ready(project.path()).await.unwrap();

    manager.clear(project.path()).await.unwrap();
    let layout = layout(cache.path(), project.path());
    assert!(!layout.record_path().exists());
    assert!(!layout.store_path(&index.record.generation).exists());
    assert!(layout.other_generations(None).is_empty());

    let status = manager.status(project.path()).await.unwrap();
    assert!(status.record.is_none());
    assert!(!status.in_memory);

    manager.ensure_index_ready(project.path()).await.unwrap();
    assert_eq!(manager.rebuild_count(), 2);
}
