//! Error types for dhf-rag operations

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Structured error payload for machine-readable output.
///
/// Emitted by the CLI in `--json` mode so callers can branch on `code`
/// and decide whether to retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub hint: String,
    pub retriable: bool,
}

impl ErrorEnvelope {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
        retriable: bool,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: hint.into(),
            retriable,
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self::new(
            "internal_error",
            msg,
            "Run with RUST_LOG=debug for details",
            false,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DhfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error at {}: {source}", .path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache file {}: {reason}", .path.display())]
    CorruptCache { path: PathBuf, reason: String },

    #[error("Embedding backend failure: {0}")]
    Embedding(String),

    #[error("Timed out after {waited:?} waiting for index lease on {}", .project.display())]
    LockTimeout { project: PathBuf, waited: Duration },

    #[error("Index rebuild failed for {}: {source}", .project.display())]
    CacheBuild {
        project: PathBuf,
        #[source]
        source: Arc<DhfError>,
    },

    #[error("Project directory not found: {}", .0.display())]
    ProjectNotFound(PathBuf),

    #[error("Unsupported document format: {}", .0.display())]
    Unsupported(PathBuf),

    #[error("Config already exists at {}", .0.display())]
    ConfigExists(PathBuf),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Glob pattern error: {0}")]
    GlobPattern(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DhfError {
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptCache {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io(_) | Self::IoAt { .. } | Self::LockTimeout { .. } | Self::Embedding(_) => {
                true
            }
            Self::CacheBuild { source, .. } => source.is_retriable(),
            _ => false,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::IoAt { .. } => "transient_io",
            Self::CorruptCache { .. } => "corrupt_cache",
            Self::Embedding(_) => "embedding_failure",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::CacheBuild { .. } => "cache_build",
            Self::ProjectNotFound(_) => "project_not_found",
            Self::Unsupported(_) => "unsupported_document",
            Self::ConfigExists(_) => "config_exists",
            Self::ConfigParse(_) => "config_parse",
            Self::GlobPattern(_) => "glob_pattern",
            Self::Serialization(_) => "serialization",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let hint = match self {
            Self::LockTimeout { .. } => "Another process is rebuilding this project; retry shortly",
            Self::CacheBuild { .. } => "The previous index (if any) is still usable; retry the request",
            Self::Embedding(_) => "Check that the embedding backend is reachable",
            Self::CorruptCache { .. } => "Run `dhf-rag clear` to drop the cache, then index again",
            Self::ProjectNotFound(_) => "Check the project path",
            Self::ConfigParse(_) => "Fix the TOML in .dhf-rag.toml",
            _ => "Run with RUST_LOG=debug for details",
        };
        ErrorEnvelope::new(self.code(), self.to_string(), hint, self.is_retriable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_build_inherits_retriability_from_source() {
        let timeout = DhfError::CacheBuild {
            project: PathBuf::from("/p"),
            source: Arc::new(DhfError::LockTimeout {
                project: PathBuf::from("/p"),
                waited: Duration::from_secs(30),
            }),
        };
        assert!(timeout.is_retriable());

        let bad_config = DhfError::CacheBuild {
            project: PathBuf::from("/p"),
            source: Arc::new(DhfError::ConfigParse("bad".to_string())),
        };
        assert!(!bad_config.is_retriable());
    }

    #[test]
    fn envelope_carries_code_and_retry_flag() {
        let env = DhfError::Embedding("connection refused".to_string()).envelope();
        assert_eq!(env.code, "embedding_failure");
        assert!(env.retriable);
        assert!(env.message.contains("connection refused"));
    }
}
