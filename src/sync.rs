//! Sync pipeline: corpus → extraction → chunks → embeddings → vector store.
//!
//! A run loads the persisted [`SyncState`](crate::state::SyncState), scans
//! the corpus, deletes the points of removed documents, then pushes every
//! new or changed document through its own pipeline task (at most
//! `sync.workers` at once):
//!
//! ```text
//! extract ──► chunk ──► embed (orchestrator) ──► stage ──► upsert ──► delete stale ──► commit
//! ```
//!
//! The last four steps belong to the [`Synchronizer`] and form the
//! per-document write protocol. Staging records the ids about to be
//! upserted before any write, so a crash never leaves points the state
//! does not know about. Stale ids are those the previous entry tracked
//! (committed or pending) that the new version no longer contains; they are
//! deleted only after the upserts succeeded.
//!
//! Chunks whose ids are already committed for the same fingerprint are not
//! re-embedded or re-written, so retrying a partially failed document only
//! touches what is missing, and a run with no source changes performs no
//! vector-store writes at all.
//!
//! Failures are scoped: a document that cannot be extracted, embedded or
//! written is marked incomplete and reported, and the run continues; its
//! previously indexed points stay in place. Before the first write a run
//! checks that the configured embedding model matches the one the
//! collection was built with and that the backend answers with the
//! configured dimension. A mismatch there, or a state-database error,
//! aborts the run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::chunk::chunk_document;
use crate::config::{ChunkingConfig, CorpusConfig, VectorStoreConfig};
use crate::error::BackendError;
use crate::extract::{Extraction, Extractor};
use crate::models::{Document, FailedChunk};
use crate::orchestrator::EmbeddingOrchestrator;
use crate::retry::RetryPolicy;
use crate::scanner::{scan_corpus, ScanReport, ScanWarning};
use crate::state::{RunRecord, RunStatus, StateStore, StateWriter, SyncEntry, SyncState};
use crate::vector_store::{Point, PointPayload, VectorStore};

/// Cooperative cancellation, checked between documents.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    #[serde(serialize_with = "serialize_status")]
    pub status: RunStatus,
    pub documents_indexed: u64,
    pub documents_unchanged: u64,
    pub documents_removed: u64,
    pub documents_skipped: u64,
    pub documents_failed: Vec<DocumentFailure>,
    pub chunks_upserted: u64,
    pub chunks_deleted: u64,
    pub chunks_failed: Vec<FailedChunk>,
    #[serde(skip)]
    pub warnings: Vec<ScanWarning>,
}

fn serialize_status<S: serde::Serializer>(status: &RunStatus, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(status.as_str())
}

impl SyncReport {
    pub fn empty(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            documents_indexed: 0,
            documents_unchanged: 0,
            documents_removed: 0,
            documents_skipped: 0,
            documents_failed: Vec::new(),
            chunks_upserted: 0,
            chunks_deleted: 0,
            chunks_failed: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.documents_failed.is_empty() || !self.chunks_failed.is_empty()
    }

    fn to_record(&self, record: &mut RunRecord) {
        record.status = self.status;
        record.finished_at = Some(Utc::now());
        record.documents_indexed = self.documents_indexed;
        record.documents_failed = self.documents_failed.len() as u64;
        record.documents_removed = self.documents_removed;
        record.chunks_upserted = self.chunks_upserted;
        record.chunks_deleted = self.chunks_deleted;
        record.chunks_failed = self.chunks_failed.len() as u64;
    }
}

// ============ Synchronizer ============

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("sync state update failed: {0:#}")]
    State(anyhow::Error),
}

impl WriteError {
    /// Errors that must stop the whole run.
    pub fn is_fatal(&self) -> bool {
        match self {
            WriteError::Backend(err) => err.is_configuration(),
            WriteError::State(_) => true,
        }
    }
}

/// Everything the synchronizer needs to bring one document up to date.
#[derive(Debug, Clone, Default)]
pub struct DocumentWrite {
    /// Ids the entry will own after commit, in ordinal order.
    pub committed_ids: Vec<String>,
    /// Points to upsert (a subset of `committed_ids`).
    pub points: Vec<Point>,
    pub complete: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub upserted: u64,
    pub deleted: u64,
}

/// Applies per-document changes to the vector store and the sync state.
#[derive(Clone)]
pub struct Synchronizer {
    store: Arc<dyn VectorStore>,
    collection: String,
    policy: RetryPolicy,
    write_batch_size: usize,
    permits: Arc<Semaphore>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn VectorStore>, config: &VectorStoreConfig, policy: RetryPolicy) -> Self {
        Self {
            store,
            collection: config.collection.clone(),
            policy,
            write_batch_size: config.write_batch_size.max(1),
            permits: Arc::new(Semaphore::new(config.write_concurrency.max(1))),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Points currently stored in the collection.
    pub async fn point_count(&self) -> Result<u64, BackendError> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.policy
            .run("vector-store", move || store.count(collection))
            .await
    }

    /// Make sure the collection exists with `dims`-sized vectors.
    pub async fn prepare(&self, dims: usize) -> Result<(), BackendError> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        self.policy
            .run("vector-store", move || store.ensure_collection(collection, dims))
            .await
    }

    pub async fn write_document(
        &self,
        writer: &StateWriter,
        doc: &Document,
        previous: Option<&SyncEntry>,
        plan: DocumentWrite,
    ) -> Result<WriteOutcome, WriteError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| BackendError::transport("vector-store", e))?;
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        let mut outcome = WriteOutcome::default();

        if !plan.points.is_empty() {
            let ids = plan.points.iter().map(|p| p.id.clone()).collect();
            writer.stage(doc, ids).await.map_err(WriteError::State)?;
        }

        for batch in plan.points.chunks(self.write_batch_size) {
            let result = self
                .policy
                .run("vector-upsert", move || store.upsert(collection, batch))
                .await;
            if let Err(err) = result {
                return Err(self.abandon(writer, doc, err).await);
            }
            outcome.upserted += batch.len() as u64;
        }

        let keep: HashSet<&str> = plan.committed_ids.iter().map(String::as_str).collect();
        let stale: Vec<String> = previous
            .map(|entry| {
                entry
                    .tracked_ids()
                    .into_iter()
                    .filter(|id| !keep.contains(id.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        for batch in stale.chunks(self.write_batch_size) {
            let result = self
                .policy
                .run("vector-delete", move || store.delete(collection, batch))
                .await;
            if let Err(err) = result {
                return Err(self.abandon(writer, doc, err).await);
            }
            outcome.deleted += batch.len() as u64;
        }

        writer
            .commit(doc, plan.committed_ids, plan.complete, plan.error)
            .await
            .map_err(WriteError::State)?;
        Ok(outcome)
    }

    /// Delete every point `entry` tracks, then forget the entry.
    pub async fn remove_document(
        &self,
        writer: &StateWriter,
        entry: &SyncEntry,
    ) -> Result<u64, WriteError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| BackendError::transport("vector-store", e))?;
        let store = self.store.as_ref();
        let collection = self.collection.as_str();
        let ids: Vec<String> = entry.tracked_ids().into_iter().collect();

        for batch in ids.chunks(self.write_batch_size) {
            self.policy
                .run("vector-delete", move || store.delete(collection, batch))
                .await?;
        }
        writer
            .remove(&entry.path)
            .await
            .map_err(WriteError::State)?;
        Ok(ids.len() as u64)
    }

    async fn abandon(&self, writer: &StateWriter, doc: &Document, err: BackendError) -> WriteError {
        if let Err(state_err) = writer.fail(doc, err.to_string()).await {
            return WriteError::State(state_err);
        }
        WriteError::Backend(err)
    }
}

// ============ Pipeline ============

enum DocOutcome {
    Indexed {
        write: WriteOutcome,
        failed_chunks: Vec<FailedChunk>,
    },
    Skipped {
        write: WriteOutcome,
    },
    Failed(DocumentFailure),
}

/// The full write path, cloned into each document task.
#[derive(Clone)]
pub struct SyncPipeline {
    pub corpus: CorpusConfig,
    pub chunking: ChunkingConfig,
    pub workers: usize,
    pub state: StateStore,
    pub extractor: Arc<dyn Extractor>,
    pub orchestrator: EmbeddingOrchestrator,
    pub synchronizer: Synchronizer,
}

impl SyncPipeline {
    /// Classify the corpus against the persisted state without writing.
    pub async fn scan(&self) -> Result<ScanReport> {
        let state = self.state.load_sync_state().await?;
        let corpus = self.corpus.clone();
        tokio::task::spawn_blocking(move || scan_corpus(&corpus, &state))
            .await
            .context("scan task panicked")?
    }

    /// Execute one sync run and persist its [`RunRecord`].
    pub async fn run(&self, run_id: &str, cancel: &CancelFlag) -> Result<SyncReport> {
        let mut record = RunRecord::started(run_id);
        self.state.save_run(&record).await?;
        tracing::info!(run_id, collection = self.synchronizer.collection(), "sync started");

        match self.run_inner(run_id, cancel).await {
            Ok(report) => {
                report.to_record(&mut record);
                self.state.save_run(&record).await?;
                tracing::info!(
                    run_id,
                    status = %report.status,
                    indexed = report.documents_indexed,
                    removed = report.documents_removed,
                    failed = report.documents_failed.len(),
                    chunks_upserted = report.chunks_upserted,
                    chunks_deleted = report.chunks_deleted,
                    chunks_failed = report.chunks_failed.len(),
                    "sync finished"
                );
                Ok(report)
            }
            Err(err) => {
                record.status = RunStatus::Failed;
                record.finished_at = Some(Utc::now());
                record.error = Some(format!("{:#}", err));
                if let Err(save_err) = self.state.save_run(&record).await {
                    tracing::warn!(run_id, error = %save_err, "failed to record failed run");
                }
                tracing::error!(run_id, error = %format!("{:#}", err), "sync failed");
                Err(err)
            }
        }
    }

    async fn run_inner(&self, run_id: &str, cancel: &CancelFlag) -> Result<SyncReport> {
        let mut report = SyncReport::empty(run_id);
        let model = self.orchestrator.model_name();
        let dims = self.orchestrator.dims();
        self.state.check_model(model, dims).await?;

        let state = self.state.load_sync_state().await?;
        let corpus = self.corpus.clone();
        let scan_state = state.clone();
        let scan = tokio::task::spawn_blocking(move || scan_corpus(&corpus, &scan_state))
            .await
            .context("scan task panicked")??;

        report.documents_unchanged = scan.unchanged.len() as u64;
        report.documents_skipped = scan.skipped.len() as u64;
        report.warnings = scan.warnings.clone();

        if !scan.has_changes() {
            report.status = RunStatus::Completed;
            return Ok(report);
        }

        // Nothing is written until the backend has answered with the
        // configured dimension.
        self.orchestrator
            .verify_backend()
            .await
            .map_err(|e| anyhow!(e).context("embedding backend is not usable"))?;
        self.synchronizer
            .prepare(dims)
            .await
            .map_err(|e| anyhow!(e).context("vector store collection is not usable"))?;
        self.state.record_model(model, dims).await?;

        let (writer, writer_task) = StateWriter::spawn(self.state.clone());
        let result = self
            .apply_changes(&scan, &state, &writer, cancel, &mut report)
            .await;
        drop(writer);
        writer_task.await.context("state writer panicked")?;
        result?;

        report.status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if report.has_failures() {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };
        Ok(report)
    }

    async fn apply_changes(
        &self,
        scan: &ScanReport,
        state: &SyncState,
        writer: &StateWriter,
        cancel: &CancelFlag,
        report: &mut SyncReport,
    ) -> Result<()> {
        for path in &scan.removed {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Some(entry) = state.get(path) else {
                continue;
            };
            match self.synchronizer.remove_document(writer, entry).await {
                Ok(deleted) => {
                    report.documents_removed += 1;
                    report.chunks_deleted += deleted;
                }
                Err(err) if err.is_fatal() => return Err(anyhow!(err)),
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "failed to remove document");
                    report.documents_failed.push(DocumentFailure {
                        path: path.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let workers = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut fatal: Option<anyhow::Error> = None;

        for doc in scan.pending() {
            if cancel.is_cancelled() {
                tracing::info!("sync cancelled; waiting for in-flight documents");
                break;
            }
            // Reap finished tasks so a fatal error stops new work early.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(err) = record_outcome(joined, report) {
                    fatal.get_or_insert(err);
                }
            }
            if fatal.is_some() {
                break;
            }

            let permit = Arc::clone(&workers)
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let pipeline = self.clone();
            let doc = doc.clone();
            let previous = state.get(&doc.path).cloned();
            let writer = writer.clone();
            tasks.spawn(async move {
                let _permit = permit;
                pipeline.process(doc, previous, writer).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = record_outcome(joined, report) {
                fatal.get_or_insert(err);
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn process(
        self,
        doc: Document,
        previous: Option<SyncEntry>,
        writer: StateWriter,
    ) -> Result<DocOutcome> {
        let extractor = Arc::clone(&self.extractor);
        let abs_path = doc.abs_path.clone();
        let format = doc.format;
        let extraction = tokio::task::spawn_blocking(move || extractor.extract(&abs_path, format))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        let extracted = match extraction {
            Ok(Extraction::Text(extracted)) => extracted,
            Ok(Extraction::Skipped { reason }) => {
                tracing::info!(path = %doc.path, %reason, "document skipped");
                let plan = DocumentWrite {
                    complete: true,
                    ..DocumentWrite::default()
                };
                return match self
                    .synchronizer
                    .write_document(&writer, &doc, previous.as_ref(), plan)
                    .await
                {
                    Ok(write) => Ok(DocOutcome::Skipped { write }),
                    Err(err) => write_failure(&doc, err),
                };
            }
            Err(reason) => {
                tracing::warn!(path = %doc.path, %reason, "extraction failed");
                writer.fail(&doc, reason.clone()).await?;
                return Ok(DocOutcome::Failed(DocumentFailure {
                    path: doc.path.clone(),
                    reason,
                }));
            }
        };

        let chunks = chunk_document(&doc.path, &doc.fingerprint, &extracted.text, &self.chunking);
        let carried: HashSet<String> = match &previous {
            Some(entry) if entry.fingerprint == doc.fingerprint => {
                entry.chunk_ids.iter().cloned().collect()
            }
            _ => HashSet::new(),
        };
        let to_embed: Vec<_> = chunks
            .iter()
            .filter(|c| !carried.contains(&c.id))
            .cloned()
            .collect();

        let embedded = self
            .orchestrator
            .embed(to_embed)
            .await
            .map_err(|e| anyhow!(e).context(format!("embedding {}", doc.path)))?;

        let embedded_ids: HashSet<&str> =
            embedded.embedded.iter().map(|e| e.chunk.id.as_str()).collect();
        let committed_ids: Vec<String> = chunks
            .iter()
            .filter(|c| carried.contains(&c.id) || embedded_ids.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();

        // Without a single replacement point every old id would look stale.
        if committed_ids.is_empty() && !chunks.is_empty() {
            let cause = embedded
                .failed
                .first()
                .map(|c| c.reason.as_str())
                .unwrap_or("no vectors returned");
            let reason = format!("all {} chunks failed to embed: {}", chunks.len(), cause);
            tracing::warn!(path = %doc.path, %reason, "keeping previously indexed points");
            writer.fail(&doc, reason.clone()).await?;
            return Ok(DocOutcome::Failed(DocumentFailure {
                path: doc.path.clone(),
                reason,
            }));
        }

        let indexed_at = Utc::now().timestamp();
        let points: Vec<Point> = embedded
            .embedded
            .into_iter()
            .map(|e| Point {
                id: e.chunk.id,
                vector: e.vector,
                payload: PointPayload {
                    path: e.chunk.path,
                    ordinal: e.chunk.ordinal,
                    text: e.chunk.text,
                    fingerprint: e.chunk.fingerprint,
                    format: doc.format.as_str().to_string(),
                    modified_at: doc.mtime,
                    indexed_at,
                    metadata: extracted.metadata.clone(),
                },
            })
            .collect();

        let failed_chunks = embedded.failed;
        let complete = failed_chunks.is_empty();
        let plan = DocumentWrite {
            committed_ids,
            points,
            complete,
            error: (!complete).then(|| {
                format!("{} of {} chunks failed to embed", failed_chunks.len(), chunks.len())
            }),
        };

        match self
            .synchronizer
            .write_document(&writer, &doc, previous.as_ref(), plan)
            .await
        {
            Ok(write) => {
                tracing::debug!(
                    path = %doc.path,
                    chunks = chunks.len(),
                    upserted = write.upserted,
                    deleted = write.deleted,
                    "document synced"
                );
                Ok(DocOutcome::Indexed {
                    write,
                    failed_chunks,
                })
            }
            Err(err) => write_failure(&doc, err),
        }
    }
}

fn write_failure(doc: &Document, err: WriteError) -> Result<DocOutcome> {
    if err.is_fatal() {
        return Err(anyhow!(err).context(format!("writing {}", doc.path)));
    }
    tracing::warn!(path = %doc.path, error = %err, "document write failed");
    Ok(DocOutcome::Failed(DocumentFailure {
        path: doc.path.clone(),
        reason: err.to_string(),
    }))
}

fn record_outcome(
    joined: std::result::Result<Result<DocOutcome>, tokio::task::JoinError>,
    report: &mut SyncReport,
) -> Result<()> {
    match joined.context("document task panicked")?? {
        DocOutcome::Indexed {
            write,
            failed_chunks,
        } => {
            report.documents_indexed += 1;
            report.chunks_upserted += write.upserted;
            report.chunks_deleted += write.deleted;
            report.chunks_failed.extend(failed_chunks);
        }
        DocOutcome::Skipped { write } => {
            report.documents_skipped += 1;
            report.chunks_deleted += write.deleted;
        }
        DocOutcome::Failed(failure) => report.documents_failed.push(failure),
    }
    Ok(())
}
