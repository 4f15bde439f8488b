//! Embedding orchestrator.
//!
//! Turns chunks into [`EmbeddedChunk`]s through an [`EmbeddingBackend`]:
//!
//! 1. Chunks are grouped into batches bounded by `batch_size` chunks and
//!    `max_batch_chars` characters.
//! 2. Batches run concurrently, but never more than `max_concurrency` at a
//!    time across the whole process (one shared semaphore).
//! 3. A failing batch is retried as a whole under the [`RetryPolicy`]. If it
//!    still fails, each chunk is retried on its own with the same policy; a
//!    chunk that fails every attempt is reported as a [`FailedChunk`].
//!
//! Every input chunk ends up in exactly one of `embedded` or `failed`. A
//! vector whose length differs from the backend's declared dimension is a
//! configuration error and aborts the call.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingBackend;
use crate::error::BackendError;
use crate::models::{Chunk, EmbeddedChunk, FailedChunk};
use crate::retry::RetryPolicy;

const SAMPLE_TEXT: &str = "embedding backend check";

#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub embedded: Vec<EmbeddedChunk>,
    pub failed: Vec<FailedChunk>,
}

#[derive(Clone)]
pub struct EmbeddingOrchestrator {
    backend: Arc<dyn EmbeddingBackend>,
    policy: RetryPolicy,
    batch_size: usize,
    max_batch_chars: usize,
    permits: Arc<Semaphore>,
}

impl EmbeddingOrchestrator {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        config: &EmbeddingConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            policy,
            batch_size: config.batch_size.max(1),
            max_batch_chars: config.max_batch_chars.max(1),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    /// Embed `chunks`. Only configuration errors are returned as `Err`;
    /// every other failure is reported per chunk in the outcome.
    pub async fn embed(&self, chunks: Vec<Chunk>) -> Result<EmbedOutcome, BackendError> {
        let mut outcome = EmbedOutcome::default();
        if chunks.is_empty() {
            return Ok(outcome);
        }

        let batches = make_batches(chunks, self.batch_size, self.max_batch_chars);
        let mut tasks = JoinSet::new();
        for batch in batches {
            let this = self.clone();
            tasks.spawn(async move { this.embed_batch(batch).await });
        }

        while let Some(joined) = tasks.join_next().await {
            let (embedded, failed) = match joined {
                Ok(Ok(parts)) => parts,
                Ok(Err(err)) => {
                    tasks.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    tasks.abort_all();
                    return Err(BackendError::transport("embedding", join_err));
                }
            };
            outcome.embedded.extend(embedded);
            outcome.failed.extend(failed);
        }

        outcome
            .embedded
            .sort_by(|a, b| (&a.chunk.path, a.chunk.ordinal).cmp(&(&b.chunk.path, b.chunk.ordinal)));
        outcome
            .failed
            .sort_by(|a, b| (&a.path, a.ordinal).cmp(&(&b.path, b.ordinal)));
        Ok(outcome)
    }

    /// Embed a single query string with the same backend and policy.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let texts = vec![text.to_string()];
        let _permit = self.acquire().await?;
        let mut vectors = self.request(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| BackendError::protocol("embedding", "empty embedding response"))
    }

    /// Embed one sample text. Fails with the backend error, or with
    /// [`BackendError::Dimension`] when the vector length differs from
    /// `dims()`. Run before anything is written.
    pub async fn verify_backend(&self) -> Result<(), BackendError> {
        self.embed_query(SAMPLE_TEXT).await.map(|_| ())
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit, BackendError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| BackendError::transport("embedding", e))
    }

    /// One logical request under the retry policy, with shape checks.
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let backend = self.backend.as_ref();
        self.policy
            .run("embedding", move || check_shape(backend, texts))
            .await
    }

    async fn embed_batch(
        &self,
        batch: Vec<Chunk>,
    ) -> Result<(Vec<EmbeddedChunk>, Vec<FailedChunk>), BackendError> {
        let _permit = self.acquire().await?;
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        let batch_err = match self.request(&texts).await {
            Ok(vectors) => {
                let embedded = batch
                    .into_iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
                    .collect();
                return Ok((embedded, Vec::new()));
            }
            Err(err) if err.is_configuration() => return Err(err),
            Err(err) => err,
        };

        if batch.len() > 1 {
            tracing::debug!(
                chunks = batch.len(),
                error = %batch_err,
                "embedding batch failed; retrying chunks individually"
            );
        }

        let mut embedded = Vec::new();
        let mut failed = Vec::new();
        for chunk in batch {
            let result = if texts.len() == 1 {
                // Already retried as a batch of one.
                Err(batch_err.clone())
            } else {
                self.request(std::slice::from_ref(&chunk.text)).await
            };

            match result {
                Ok(mut vectors) => match vectors.pop() {
                    Some(vector) => embedded.push(EmbeddedChunk { chunk, vector }),
                    None => failed.push(failed_chunk(&chunk, "empty embedding response")),
                },
                Err(err) if err.is_configuration() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        path = %chunk.path,
                        ordinal = chunk.ordinal,
                        error = %err,
                        "chunk embedding failed"
                    );
                    failed.push(failed_chunk(&chunk, &err.to_string()));
                }
            }
        }

        Ok((embedded, failed))
    }
}

async fn check_shape(
    backend: &dyn EmbeddingBackend,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, BackendError> {
    let vectors = backend.embed(texts).await?;
    if vectors.len() != texts.len() {
        return Err(BackendError::protocol(
            "embedding",
            format!("expected {} vectors, got {}", texts.len(), vectors.len()),
        ));
    }
    let dims = backend.dims();
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(BackendError::Dimension {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(vectors)
}

fn failed_chunk(chunk: &Chunk, reason: &str) -> FailedChunk {
    FailedChunk {
        chunk_id: chunk.id.clone(),
        path: chunk.path.clone(),
        ordinal: chunk.ordinal,
        reason: reason.to_string(),
    }
}

/// Group chunks in order. A chunk larger than `max_chars` gets a batch of
/// its own.
fn make_batches(chunks: Vec<Chunk>, max_items: usize, max_chars: usize) -> Vec<Vec<Chunk>> {
    let mut batches = Vec::new();
    let mut current: Vec<Chunk> = Vec::new();
    let mut current_chars = 0;

    for chunk in chunks {
        let len = chunk.text.len();
        if !current.is_empty() && (current.len() >= max_items || current_chars + len > max_chars)
        {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += len;
        current.push(chunk);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
