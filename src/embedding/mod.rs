//! Embedding backends.
//!
//! [`EmbeddingBackend`] is the only way the rest of the crate turns text
//! into vectors. Backends make exactly one request per call and never
//! retry; batching, concurrency limits and retries belong to the
//! [`EmbeddingOrchestrator`](crate::orchestrator::EmbeddingOrchestrator).
//!
//! | Config value | Backend | Endpoint |
//! |--------------|---------|----------|
//! | `"ollama"` | [`OllamaEmbedder`] | `POST {url}/api/embed` |
//! | `"openai"` | [`OpenAIEmbedder`] | `POST {url}/v1/embeddings` |
//! | `"local"` | `LocalEmbedder` | in-process fastembed (feature `local-embeddings-fastembed`) |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{status_error, BackendError};

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier, e.g. `"all-minilm"`.
    fn model_name(&self) -> &str;
    /// Declared vector dimensionality.
    fn dims(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;
}

pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(local::LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!(
            "Local embedding provider requires building with --features local-embeddings-fastembed"
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn json_vector(value: &serde_json::Value, backend: &'static str) -> Result<Vec<f32>, BackendError> {
    value
        .as_array()
        .ok_or_else(|| BackendError::protocol(backend, "embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| BackendError::protocol(backend, "embedding contains a non-number"))
        })
        .collect()
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            dims: config.dims,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        const BACKEND: &str = "ollama-embed";
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))?;

        if !response.status().is_success() {
            return Err(status_error(BACKEND, response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, BackendError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| BackendError::protocol("ollama-embed", "missing embeddings array"))?
        .iter()
        .map(|e| json_vector(e, "ollama-embed"))
        .collect()
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    timeout: Duration,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        const BACKEND: &str = "openai-embed";
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))?;

        if !response.status().is_success() {
            return Err(status_error(BACKEND, response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))?;
        parse_openai_response(&json)
    }
}

/// `data[].embedding`, reordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, BackendError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| BackendError::protocol("openai-embed", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| BackendError::protocol("openai-embed", "missing embedding"))?;
        indexed.push((index, json_vector(embedding, "openai-embed")?));
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use std::sync::{Arc, Mutex};

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::EmbeddingBackend;
    use crate::config::EmbeddingConfig;
    use crate::error::BackendError;

    const BACKEND: &str = "fastembed";

    /// In-process sentence-transformer. The model is downloaded and loaded on
    /// first use, then kept for the life of the process.
    pub struct LocalEmbedder {
        model_name: String,
        model: fastembed::EmbeddingModel,
        dims: usize,
        loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            Ok(Self {
                model_name: config.model.clone(),
                model: fastembed_model(&config.model)?,
                dims: config.dims,
                loaded: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm" | "all-minilm-l6-v2" | "all-MiniLM-L6-v2" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2)
            }
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        }
    }

    #[async_trait]
    impl EmbeddingBackend for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            let texts = texts.to_vec();
            let loaded = Arc::clone(&self.loaded);
            let model = self.model.clone();

            tokio::task::spawn_blocking(move || {
                let mut guard = loaded
                    .lock()
                    .map_err(|_| BackendError::protocol(BACKEND, "model lock poisoned"))?;
                if guard.is_none() {
                    let instance =
                        fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(model))
                            .map_err(|e| BackendError::transport(BACKEND, e))?;
                    *guard = Some(instance);
                }
                let Some(instance) = guard.as_mut() else {
                    return Err(BackendError::protocol(BACKEND, "model not loaded"));
                };
                instance
                    .embed(texts, None)
                    .map_err(|e| BackendError::protocol(BACKEND, e.to_string()))
            })
            .await
            .map_err(|e| BackendError::transport(BACKEND, e))?
        }
    }
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ollama_response() {
        let json = json!({"model": "all-minilm", "embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ollama_missing_embeddings_is_protocol_error() {
        let err = parse_ollama_response(&json!({"error": "model not found"})).unwrap_err();
        assert!(matches!(err, BackendError::Protocol { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_openai_response_reorders_by_index() {
        let json = json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn test_non_numeric_component_rejected() {
        let json = json!({"embeddings": [[0.1, "x"]]});
        assert!(parse_ollama_response(&json).is_err());
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "nope".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_backend(&config).is_err());
    }

    #[test]
    fn test_ollama_backend_reports_configured_model() {
        let backend = create_backend(&EmbeddingConfig::default()).unwrap();
        assert_eq!(backend.model_name(), "all-minilm");
        assert_eq!(backend.dims(), 384);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
