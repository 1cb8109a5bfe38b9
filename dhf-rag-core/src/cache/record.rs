//! On-disk cache layout, cache records and atomic file replacement

use crate::document::Summary;
use crate::error::DhfError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Bumped when any persisted format changes; older records are misses.
pub const SCHEMA_VERSION: u32 = 2;

const STORE_PREFIX: &str = "vector_store.";
const SUMMARIES_PREFIX: &str = "summaries.";
const RECORD_FILE: &str = "cache_record.json";
const LOCKS_DIR: &str = "locks";

/// Paths of one project's cache, scoped by a hash of the canonical project path.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    project: PathBuf,
    key: String,
    dir: PathBuf,
    lease_path: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_root: &Path, project: &Path) -> crate::Result<Self> {
        let project = project
            .canonicalize()
            .map_err(|_| DhfError::ProjectNotFound(project.to_path_buf()))?;
        let key = project_key(&project);
        Ok(Self {
            dir: cache_root.join(&key),
            lease_path: cache_root.join(LOCKS_DIR).join(format!("{key}.lease")),
            project,
            key,
        })
    }

    /// Canonical project path
    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Vector store written by build `generation`
    pub fn store_path(&self, generation: &str) -> PathBuf {
        self.dir.join(format!("{STORE_PREFIX}{generation}.json"))
    }

    pub fn summaries_path(&self, generation: &str) -> PathBuf {
        self.dir.join(format!("{SUMMARIES_PREFIX}{generation}.json"))
    }

    /// Store and summaries files of every generation except `keep`.
    pub fn other_generations(&self, keep: Option<&str>) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let kept: Vec<PathBuf> = keep
            .map(|g| vec![self.store_path(g), self.summaries_path(g)])
            .unwrap_or_default();
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| {
                        (n.starts_with(STORE_PREFIX) || n.starts_with(SUMMARIES_PREFIX)) && n.ends_with(".json")
                    })
            })
            .filter(|path| !kept.contains(path))
            .collect();
        paths.sort();
        paths
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    pub fn lease_path(&self) -> &Path {
        &self.lease_path
    }
}

/// Fresh name for the files of one build
pub fn new_generation() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn project_key(canonical: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Durable proof that the persisted store matches a file-set state.
///
/// Written last, so its presence means the store and summaries of its
/// `generation` are complete. Earlier generations stay on disk until the
/// record naming their successor is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub schema_version: u32,
    pub generation: String,
    pub project_path: String,
    pub fingerprint: String,
    pub vector_store_fingerprint: String,
    pub indexed_at: String,
    pub model_id: String,
    pub chunk_count: usize,
    pub file_count: usize,
}

impl CacheRecord {
    /// `Ok(None)` when no record exists yet.
    pub fn load(path: &Path) -> crate::Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DhfError::io_at(path, e)),
        };
        let record: Self = serde_json::from_slice(&bytes)
            .map_err(|e| DhfError::corrupt(path, format!("invalid cache record: {e}")))?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(DhfError::corrupt(
                path,
                format!("schema version {} (expected {SCHEMA_VERSION})", record.schema_version),
            ));
        }
        Ok(Some(record))
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummariesFile {
    pub fingerprint: String,
    pub summaries: Vec<Summary>,
}

impl SummariesFile {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let bytes = fs::read(path).map_err(|e| DhfError::io_at(path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DhfError::corrupt(path, format!("invalid summaries: {e}")))
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        write_atomic(path, &serde_json::to_vec(self)?)
    }
}

/// Current UTC time as RFC 3339
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// content, never a partial file.
///
/// Writes a uniquely named sibling, syncs it, then renames over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| DhfError::io_at(path, std::io::Error::other("path has no parent")))?;
    fs::create_dir_all(dir).map_err(|e| DhfError::io_at(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(DhfError::io_at(path, e));
    }

    // Make the rename durable; not all platforms can open directories.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> crate::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DhfError::io_at(path, e)),
    }
}
