//! TOML configuration.
//!
//! A single file (default `./config/pka.toml`) configures the corpus, the
//! SQLite state database, the three remote backends, and the scheduler.
//! Only `[db]` and `[corpus]` are required; every other section falls back
//! to defaults that match a local Ollama + Qdrant deployment.
//!
//! ```toml
//! [db]
//! path = "./data/pka.sqlite"
//!
//! [corpus]
//! root = "./data/notes"
//!
//! [embedding]
//! provider = "ollama"
//! model = "all-minilm"
//! dims = 384
//!
//! [vector_store]
//! provider = "qdrant"
//! url = "http://localhost:6333"
//! collection = "personal_knowledge"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub summaries: SummariesConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Index dot-files and files under dot-directories.
    #[serde(default)]
    pub include_hidden: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        // 1000 / 200 characters at 4 chars per token.
        Self {
            max_tokens: 250,
            overlap_tokens: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key (OpenAI provider only).
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on the summed text length of one embedding request.
    #[serde(default = "default_max_batch_chars")]
    pub max_batch_chars: usize,
    /// Embedding requests allowed in flight at once.
    #[serde(default = "default_embedding_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_embedding_dims(),
            url: None,
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_batch_chars: default_max_batch_chars(),
            max_concurrency: default_embedding_concurrency(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}
fn default_embedding_model() -> String {
    "all-minilm".to_string()
}
fn default_embedding_dims() -> usize {
    384
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_batch_chars() -> usize {
    32_000
}
fn default_embedding_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// `qdrant` or `memory` (process-local, for tests and dry experiments).
    pub provider: String,
    pub url: String,
    pub collection: String,
    /// Environment variable holding the Qdrant API key, if the server needs one.
    pub api_key_env: Option<String>,
    pub write_batch_size: usize,
    /// Documents whose vector-store writes may run at the same time.
    pub write_concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: "qdrant".to_string(),
            url: "http://localhost:6333".to_string(),
            collection: "personal_knowledge".to_string(),
            api_key_env: None,
            write_batch_size: 64,
            write_concurrency: 2,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    /// `ollama` or `disabled`.
    pub provider: String,
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub summary_temperature: f32,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            url: "http://localhost:11434".to_string(),
            model: "gemma:3b".to_string(),
            temperature: 0.1,
            summary_temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Maximum estimated tokens in an assembled context block.
    pub token_budget: usize,
    pub min_score: Option<f32>,
    /// Passages pulled in for the daily summary.
    pub summary_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            token_budget: 1500,
            min_score: None,
            summary_k: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 16_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Documents processed concurrently (extract, chunk, embed, write).
    pub workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub sync_interval_secs: u64,
    pub summary_interval_secs: u64,
    /// How far back the scheduled summary looks for changed notes.
    pub summary_lookback_hours: u64,
    /// How often job due-ness is re-evaluated.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_secs: 900,
            summary_interval_secs: 86_400,
            summary_lookback_hours: 24,
            tick_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SummariesConfig {
    pub dir: PathBuf,
}

impl Default for SummariesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/summaries"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    match config.embedding.provider.as_str() {
        "ollama" | "openai" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be ollama, openai, or local.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.model.trim().is_empty() {
        bail!("embedding.model must be specified");
    }
    if config.embedding.batch_size == 0 || config.embedding.max_concurrency == 0 {
        bail!("embedding.batch_size and embedding.max_concurrency must be > 0");
    }

    match config.vector_store.provider.as_str() {
        "qdrant" | "memory" => {}
        other => bail!(
            "Unknown vector store provider: '{}'. Must be qdrant or memory.",
            other
        ),
    }
    if config.vector_store.collection.trim().is_empty() {
        bail!("vector_store.collection must not be empty");
    }
    if config.vector_store.write_batch_size == 0 || config.vector_store.write_concurrency == 0 {
        bail!("vector_store.write_batch_size and vector_store.write_concurrency must be > 0");
    }

    match config.generation.provider.as_str() {
        "ollama" | "disabled" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be ollama or disabled.",
            other
        ),
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.token_budget == 0 {
        bail!("retrieval.token_budget must be > 0");
    }
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if config.sync.workers == 0 {
        bail!("sync.workers must be >= 1");
    }
    if config.scheduler.sync_interval_secs == 0
        || config.scheduler.summary_interval_secs == 0
        || config.scheduler.tick_secs == 0
    {
        bail!("scheduler intervals must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/pka.sqlite"

[corpus]
root = "/tmp/notes"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.chunking.max_tokens, 250);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.dims, 384);
        assert_eq!(config.vector_store.collection, "personal_knowledge");
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.corpus.include_globs, vec!["**/*".to_string()]);
        assert!(config.generation.is_enabled());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let content = format!("{}\n[chunking]\nmax_tokens = 100\noverlap_tokens = 100\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let content = format!("{}\n[embedding]\nprovider = \"magic\"\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_zero_dims_rejected() {
        let content = format!("{}\n[embedding]\ndims = 0\n", MINIMAL);
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn test_missing_corpus_section_rejected() {
        let content = "[db]\npath = \"/tmp/x.sqlite\"\n";
        assert!(parse_config(content).is_err());
    }
}
