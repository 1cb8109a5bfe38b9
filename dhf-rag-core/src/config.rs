//! Configuration for dhf-rag

use crate::DhfError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up at the project root.
pub const PROJECT_CONFIG_FILE: &str = ".dhf-rag.toml";

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# dhf-rag configuration

[layout]
# Folder holding procedure documents, one subfolder per procedure area
procedures_dir = "Procedures"
# Folder holding project context documents, one subfolder per category
context_dir = "Context"
# Context subfolder that is never cached (read fresh by the generator)
prompt_dir = "Prompt"
# Context categories only retrieved when a prompt references them
on_demand = ["General", "Regulatory Strategy"]

[indexing]
# Target characters per chunk
chunk_chars = 1200
# Characters carried over from the previous chunk
chunk_overlap = 200
# Maximum characters of the lead summary kept per document
summary_chars = 400
# Extensions the built-in loader extracts text from
extensions = ["txt", "md", "markdown", "csv", "json", "yaml", "yml"]

[embedding]
# "hashing" (local, deterministic) or "http" (Ollama-compatible /api/embed)
backend = "hashing"
dimension = 384
url = "http://127.0.0.1:11434"
model = "nomic-embed-text"

[cache]
# Cache root; per-project directories are named by a hash of the project path.
# Empty means <system temp dir>/dhf-rag-cache
root = ""
# Age after which another process may reclaim a rebuild lease
lease_ttl = "60s"
# Upper bound on waiting for a lease held by another process
lock_timeout = "30s"

[fingerprint]
# Include on-demand folders in the fingerprint (edits then invalidate the cache)
track_on_demand = false

[retrieval]
procedure_top_k = 8
context_top_k = 8
max_tokens = 6000

[assembly]
# "chars" (chars / chars_per_token) or "cl100k_base"
token_estimator = "chars"
chars_per_token = 4
instructions = """
You are a regulatory affairs specialist drafting Design History File documentation \
for a medical device. Use only the project context below. Cite source documents by \
file name. Flag missing information instead of inventing it."""
"#;

/// dhf-rag configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_procedures_dir")]
    pub procedures_dir: String,
    #[serde(default = "default_context_dir")]
    pub context_dir: String,
    #[serde(default = "default_prompt_dir")]
    pub prompt_dir: String,
    #[serde(default = "default_on_demand")]
    pub on_demand: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Hashing,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_backend")]
    pub backend: EmbeddingBackend,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub root: String,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub track_on_demand: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub procedure_top_k: usize,
    #[serde(default = "default_top_k")]
    pub context_top_k: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    #[serde(default = "default_token_estimator")]
    pub token_estimator: String,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    #[serde(default = "default_instructions")]
    pub instructions: String,
}

// Default value functions
fn default_procedures_dir() -> String {
    "Procedures".to_string()
}
fn default_context_dir() -> String {
    "Context".to_string()
}
fn default_prompt_dir() -> String {
    "Prompt".to_string()
}
fn default_on_demand() -> Vec<String> {
    vec!["General".to_string(), "Regulatory Strategy".to_string()]
}
fn default_chunk_chars() -> usize {
    1200
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_summary_chars() -> usize {
    400
}
fn default_extensions() -> Vec<String> {
    ["txt", "md", "markdown", "csv", "json", "yaml", "yml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_backend() -> EmbeddingBackend {
    EmbeddingBackend::Hashing
}
fn default_dimension() -> usize {
    384
}
fn default_embedding_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_lease_ttl() -> String {
    "60s".to_string()
}
fn default_lock_timeout() -> String {
    "30s".to_string()
}
fn default_top_k() -> usize {
    8
}
fn default_max_tokens() -> usize {
    6000
}
fn default_token_estimator() -> String {
    "chars".to_string()
}
fn default_chars_per_token() -> usize {
    4
}
fn default_instructions() -> String {
    "You are a regulatory affairs specialist drafting Design History File documentation \
     for a medical device. Use only the project context below. Cite source documents by \
     file name. Flag missing information instead of inventing it."
        .to_string()
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            procedures_dir: default_procedures_dir(),
            context_dir: default_context_dir(),
            prompt_dir: default_prompt_dir(),
            on_demand: default_on_demand(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            chunk_overlap: default_chunk_overlap(),
            summary_chars: default_summary_chars(),
            extensions: default_extensions(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            dimension: default_dimension(),
            url: default_embedding_url(),
            model: default_embedding_model(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            lease_ttl: default_lease_ttl(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            procedure_top_k: default_top_k(),
            context_top_k: default_top_k(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            token_estimator: default_token_estimator(),
            chars_per_token: default_chars_per_token(),
            instructions: default_instructions(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DhfError::io_at(path, e))?;
        Self::from_toml(&content)
    }

    /// Load `<project>/.dhf-rag.toml`, falling back to defaults when absent.
    pub fn for_project(project: &Path) -> crate::Result<Self> {
        let path = project.join(PROJECT_CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write DEFAULT_CONFIG into a project, refusing to overwrite.
    pub fn init_project(project: &Path) -> crate::Result<PathBuf> {
        let path = project.join(PROJECT_CONFIG_FILE);
        if path.exists() {
            return Err(DhfError::ConfigExists(path));
        }
        std::fs::write(&path, DEFAULT_CONFIG).map_err(|e| DhfError::io_at(&path, e))?;
        Ok(path)
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| DhfError::ConfigParse(e.to_string()))
    }

    /// Lease TTL as Duration
    pub fn lease_ttl(&self) -> Duration {
        parse_duration(&self.cache.lease_ttl).unwrap_or(Duration::from_secs(60))
    }

    /// Lock acquisition bound as Duration
    pub fn lock_timeout(&self) -> Duration {
        parse_duration(&self.cache.lock_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Resolved cache root directory
    pub fn cache_root(&self) -> PathBuf {
        if self.cache.root.trim().is_empty() {
            std::env::temp_dir().join("dhf-rag-cache")
        } else {
            PathBuf::from(self.cache.root.trim())
        }
    }
}

/// Parse duration string (e.g., "500ms", "60s", "5m", "1h")
pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }

    let (unit_at, _) = s.char_indices().last()?;
    let (num_str, unit) = s.split_at(unit_at);
    let num: u64 = num_str.parse().ok()?;

    match unit {
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        "d" => Some(Duration::from_secs(num * 86400)),
        _ => None,
    }
}
