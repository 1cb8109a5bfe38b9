//! Embedding generators

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::DhfError;
use std::sync::Arc;

/// Text to fixed-length vector.
///
/// Implementations must be deterministic: the same text always yields the
/// bit-identical vector, which means no parallel float accumulation.
pub trait Embedder: Send + Sync {
    /// Identifies the model; persisted so a model change invalidates the store.
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> crate::Result<Vec<f32>>;

    /// Embed many texts, preserving input order.
    fn embed_batch(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Build the embedder selected by config.
pub fn from_config(config: &EmbeddingConfig) -> crate::Result<Arc<dyn Embedder>> {
    match config.backend {
        EmbeddingBackend::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
        #[cfg(feature = "http-embedder")]
        EmbeddingBackend::Http => Ok(Arc::new(HttpEmbedder::new(
            &config.url,
            &config.model,
            config.dimension,
        )?)),
        #[cfg(not(feature = "http-embedder"))]
        EmbeddingBackend::Http => Err(DhfError::Embedding(
            "http backend requires the `http-embedder` feature".to_string(),
        )),
    }
}

const UNIGRAM_WEIGHT: f32 = 1.0;
const BIGRAM_WEIGHT: f32 = 0.5;
const TRIGRAM_WEIGHT: f32 = 0.25;

/// Local feature-hashing embedder.
///
/// Word unigrams, word bigrams and character trigrams are hashed into signed
/// buckets, then the vector is L2-normalised. Needs no model files.
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(8);
        Self {
            dimension,
            model_id: format!("hashing-v1-{dimension}"),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 1 { -1.0 } else { 1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let words = tokenize(text);

        for word in &words {
            self.add_feature(&mut vector, word, UNIGRAM_WEIGHT);

            let padded: Vec<char> = format!("#{word}#").chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.add_feature(&mut vector, &format!("c:{trigram}"), TRIGRAM_WEIGHT);
            }
        }
        for pair in words.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

/// Lowercased alphanumeric words
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// 64-bit FNV-1a; stable across platforms and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Client for an Ollama-compatible `/api/embed` endpoint.
#[cfg(feature = "http-embedder")]
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    model_id: String,
    dimension: usize,
}

#[cfg(feature = "http-embedder")]
#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[cfg(feature = "http-embedder")]
#[derive(serde::Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(feature = "http-embedder")]
impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> crate::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| DhfError::Embedding(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model: model.to_string(),
            model_id: format!("http-{model}-{dimension}"),
            dimension,
        })
    }
}

#[cfg(feature = "http-embedder")]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()])?;
        batch
            .pop()
            .ok_or_else(|| DhfError::Embedding("empty embedding response".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| DhfError::Embedding(e.to_string()))?;
        let body: EmbedResponse = response
            .json()
            .map_err(|e| DhfError::Embedding(e.to_string()))?;

        if body.embeddings.len() != texts.len() {
            return Err(DhfError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }
        if let Some(bad) = body.embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(DhfError::Embedding(format!(
                "expected dimension {}, got {}",
                self.dimension,
                bad.len()
            )));
        }
        Ok(body.embeddings)
    }
}
