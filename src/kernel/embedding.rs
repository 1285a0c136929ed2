// ── Kernel: Embedding Engine ────────────────────────────────────────────────
//
// L2-normalized fixed-dimension float32 vectors for semantic retrieval.
//
// Offline-first: the default provider is a deterministic SHA-256
// expansion embedder that always succeeds — no model download, no
// network, stable vectors across environments. A real model plugs in
// behind the same async trait; the `(provider, model, dim)` identity is
// recorded on every stored row so vectors from different producers are
// never mixed at query time.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use sha2::{Digest, Sha256};

use crate::atoms::constants::ENV_EMBED_ENABLED;
use crate::atoms::error::{KernelError, KernelResult};
use crate::atoms::types::EmbeddingConfig;

// ═══════════════════════════════════════════════════════════════════════════
// Provider seam
// ═══════════════════════════════════════════════════════════════════════════

/// An embedding producer. Implementations must return one L2-normalized
/// `dim`-length vector per input text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Deterministic fallback provider
// ═══════════════════════════════════════════════════════════════════════════

/// Hash-expansion embedder: each component is derived from
/// `sha256(text ":" index)`, mapped to [-1, 1], then the vector is
/// L2-normalized. Deterministic, reasonably distributed, and cheap.
pub struct HashEmbedderProvider {
    dim: usize,
}

impl HashEmbedderProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = Vec::with_capacity(self.dim);
        for i in 0..self.dim {
            let digest = Sha256::digest(format!("{text}:{i}").as_bytes());
            let int_val = i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
            vec.push(int_val as f32 / 2_147_483_648.0);
        }
        l2_normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedderProvider {
    async fn embed(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// In-place L2 normalization; zero vectors are left untouched.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm = l2_norm(vec);
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

pub fn l2_norm(vec: &[f32]) -> f32 {
    vec.iter().map(|v| v * v).sum::<f32>().sqrt()
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Orchestrates embedding generation and validates provider output
/// against the configured identity.
pub struct EmbeddingEngine {
    config: EmbeddingConfig,
    provider: Arc<dyn EmbeddingProvider>,
    enabled: bool,
}

impl EmbeddingEngine {
    pub fn new(config: EmbeddingConfig, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            provider,
            enabled: true,
        }
    }

    /// Default engine: hash-expansion fallback at the configured dim,
    /// honoring the BARTHO_EMBED_ENABLED master switch.
    pub fn with_default_provider(config: EmbeddingConfig) -> Self {
        let provider = Arc::new(HashEmbedderProvider::new(config.dim));
        let enabled = std::env::var(ENV_EMBED_ENABLED).map(|v| v != "0").unwrap_or(true);
        if !enabled {
            info!("[embedding] Embedding hook disabled via {ENV_EMBED_ENABLED}");
        }
        Self {
            config,
            provider,
            enabled,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the embedding hook is active. When off, ingestion skips
    /// the embed stage and the vector channel degrades to empty.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Generate embeddings for the given texts. Always returns one
    /// vector per text; the shape is validated against the configured
    /// dimension.
    pub async fn embed_texts(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.provider.embed(texts).await?;

        if vectors.len() != texts.len() {
            return Err(KernelError::Embedding(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        for vec in &vectors {
            if vec.len() != self.config.dim {
                return Err(KernelError::Embedding(format!(
                    "provider returned dim {} (configured {})",
                    vec.len(),
                    self.config.dim
                )));
            }
        }

        Ok(vectors)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, query: &str) -> KernelResult<Vec<f32>> {
        let mut vectors = self.embed_texts(&[query.to_string()]).await?;
        Ok(vectors.remove(0))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dim: usize) -> EmbeddingEngine {
        let config = EmbeddingConfig {
            dim,
            ..Default::default()
        };
        EmbeddingEngine::new(config.clone(), Arc::new(HashEmbedderProvider::new(dim)))
    }

    #[tokio::test]
    async fn test_fallback_embedder_is_deterministic() {
        let eng = engine(64);
        let a = eng.embed_query("the same text").await.unwrap();
        let b = eng.embed_query("the same text").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_distinct_texts_get_distinct_vectors() {
        let eng = engine(64);
        let a = eng.embed_query("alpha").await.unwrap();
        let b = eng.embed_query("beta").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_vectors_are_l2_normalized() {
        let eng = engine(384);
        let v = eng.embed_query("normalize me").await.unwrap();
        let norm = l2_norm(&v);
        assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
    }

    #[tokio::test]
    async fn test_configured_dimension_is_respected() {
        let eng = engine(128);
        let v = eng.embed_query("dims").await.unwrap();
        assert_eq!(v.len(), 128);
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_output() {
        let eng = engine(64);
        assert!(eng.embed_texts(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let eng = engine(32);
        let batch = eng
            .embed_texts(&["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(batch[0], eng.embed_query("one").await.unwrap());
        assert_eq!(batch[1], eng.embed_query("two").await.unwrap());
    }

    #[tokio::test]
    async fn test_dim_mismatch_is_an_error() {
        struct BadProvider;

        #[async_trait]
        impl EmbeddingProvider for BadProvider {
            async fn embed(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|_| vec![0.0f32; 3]).collect())
            }
        }

        let config = EmbeddingConfig {
            dim: 64,
            ..Default::default()
        };
        let eng = EmbeddingEngine::new(config, Arc::new(BadProvider));
        assert!(matches!(
            eng.embed_query("x").await,
            Err(KernelError::Embedding(_))
        ));
    }

    #[test]
    fn test_l2_normalize_leaves_zero_vector() {
        let mut v = vec![0.0f32; 4];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0f32; 4]);
    }
}
