//! Text generation backends.
//!
//! A [`GenerationBackend`] turns one prompt into one completion. Like the
//! embedding backends it makes a single request per call; the
//! [`Composer`](crate::composer::Composer) owns the retry.
//!
//! | Config value | Backend |
//! |--------------|---------|
//! | `"ollama"` | [`OllamaGenerator`], `POST {url}/api/generate` with `stream: false` |
//! | `"disabled"` | none; answers fall back to listing sources |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GenerationConfig;
use crate::error::{status_error, BackendError};

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, BackendError>;
}

/// `None` when generation is disabled in config.
pub fn create_generator(config: &GenerationConfig) -> Result<Option<Arc<dyn GenerationBackend>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "ollama" => Ok(Some(Arc::new(OllamaGenerator::new(config)?))),
        other => bail!("Unknown generation provider: {}", other),
    }
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout,
        })
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl GenerationBackend for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, BackendError> {
        const BACKEND: &str = "ollama-generate";
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": temperature },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))?;

        if !response.status().is_success() {
            return Err(status_error(BACKEND, response).await);
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))?;
        Ok(parsed.response.trim().to_string())
    }
}
