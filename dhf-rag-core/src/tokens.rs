//! Token estimation for context budgets

use crate::config::AssemblyConfig;
use tiktoken_rs::CoreBPE;

/// Estimates the token cost of rendered context.
pub enum TokenEstimator {
    /// `ceil(chars / chars_per_token)`
    Chars { chars_per_token: usize },
    /// cl100k_base BPE (GPT-4 compatible)
    Bpe(Box<CoreBPE>),
}

impl TokenEstimator {
    pub fn chars(chars_per_token: usize) -> Self {
        Self::Chars {
            chars_per_token: chars_per_token.max(1),
        }
    }

    /// Build from `[assembly]`; an unknown name or a BPE load failure falls
    /// back to character counting.
    pub fn from_config(config: &AssemblyConfig) -> Self {
        match config.token_estimator.trim().to_ascii_lowercase().as_str() {
            "cl100k_base" | "cl100k" | "tiktoken" => match tiktoken_rs::cl100k_base() {
                Ok(bpe) => Self::Bpe(Box::new(bpe)),
                Err(e) => {
                    tracing::warn!(error = %e, "cl100k_base unavailable, counting characters");
                    Self::chars(config.chars_per_token)
                }
            },
            "chars" => Self::chars(config.chars_per_token),
            other => {
                tracing::warn!(estimator = other, "unknown token estimator, counting characters");
                Self::chars(config.chars_per_token)
            }
        }
    }

    pub fn estimate(&self, text: &str) -> usize {
        match self {
            Self::Chars { chars_per_token } => text.chars().count().div_ceil(*chars_per_token),
            Self::Bpe(bpe) => bpe.encode_with_special_tokens(text).len(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chars { .. } => "chars",
            Self::Bpe(_) => "cl100k_base",
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::chars(4)
    }
}
