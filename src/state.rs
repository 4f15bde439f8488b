//! Persisted synchronization state.
//!
//! Four record kinds survive restarts, all scoped to one collection:
//!
//! | Record | Table | Purpose |
//! |--------|-------|---------|
//! | [`SyncEntry`] | `sync_documents` | what the vector store holds for each path |
//! | [`ScheduleRecord`] | `schedule_records` | last success / attempt per scheduled job |
//! | [`RunRecord`] | `sync_runs` | outcome counters of each sync run |
//! | [`CollectionModel`] | `collections` | embedding model the vectors came from |
//!
//! Each [`SyncEntry`] carries two id lists. `chunk_ids` are the points the
//! entry's fingerprint is known to be indexed under. `pending_ids` are
//! written *before* the corresponding upsert begins, so every point that may
//! exist in the store is always reachable from some entry, even after a
//! crash between the upsert and the commit.
//!
//! During a sync run, entries are only mutated by the [`StateWriter`] task;
//! pipeline workers send it commands and await an acknowledgement.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::BackendError;
use crate::models::{Document, DocumentFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub path: String,
    pub fingerprint: String,
    pub mtime: i64,
    pub size: u64,
    pub format: DocumentFormat,
    pub chunk_ids: Vec<String>,
    pub pending_ids: Vec<String>,
    /// False when the last attempt failed partially or was interrupted.
    pub complete: bool,
    pub synced_at: i64,
    pub last_error: Option<String>,
}

impl SyncEntry {
    /// Every point id this entry may own in the vector store.
    pub fn tracked_ids(&self) -> BTreeSet<String> {
        self.chunk_ids
            .iter()
            .chain(self.pending_ids.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionModel {
    pub model: String,
    pub dims: usize,
}

/// Snapshot of all entries of a collection, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    entries: BTreeMap<String, SyncEntry>,
}

impl SyncState {
    pub fn from_entries(entries: impl IntoIterator<Item = SyncEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&SyncEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Jobs driven by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {
    Sync,
    Summary,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Job::Sync => "sync",
            Job::Summary => "summary",
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRecord {
    pub job: Job,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ScheduleRecord {
    pub fn never_run(job: Job) -> Self {
        Self {
            job,
            last_success_at: None,
            last_run_id: None,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithFailures => "completed_with_failures",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "completed_with_failures" => RunStatus::CompletedWithFailures,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub documents_indexed: u64,
    pub documents_failed: u64,
    pub documents_removed: u64,
    pub chunks_upserted: u64,
    pub chunks_deleted: u64,
    pub chunks_failed: u64,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn started(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            documents_indexed: 0,
            documents_failed: 0,
            documents_removed: 0,
            chunks_upserted: 0,
            chunks_deleted: 0,
            chunks_failed: 0,
            error: None,
        }
    }
}

fn to_datetime(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
}

fn ids_from_json(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).with_context(|| format!("Corrupt id list in sync state: {}", raw))
}

fn ids_to_json(ids: &[String]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

/// SQLite-backed access to the state of one collection.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
    collection: String,
}

impl StateStore {
    pub fn new(pool: SqlitePool, collection: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Sync entries ============

    pub async fn load_sync_state(&self) -> Result<SyncState> {
        let rows = sqlx::query(
            r#"
            SELECT path, fingerprint, mtime, size, format, chunk_ids, pending_ids,
                   complete, synced_at, last_error
            FROM sync_documents
            WHERE collection = ?
            ORDER BY path
            "#,
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let format: String = row.get("format");
            let chunk_ids: String = row.get("chunk_ids");
            let pending_ids: String = row.get("pending_ids");
            let size: i64 = row.get("size");
            let complete: i64 = row.get("complete");
            entries.push(SyncEntry {
                path: row.get("path"),
                fingerprint: row.get("fingerprint"),
                mtime: row.get("mtime"),
                size: size.max(0) as u64,
                format: DocumentFormat::parse(&format)
                    .ok_or_else(|| anyhow!("Unknown document format in sync state: {}", format))?,
                chunk_ids: ids_from_json(&chunk_ids)?,
                pending_ids: ids_from_json(&pending_ids)?,
                complete: complete != 0,
                synced_at: row.get("synced_at"),
                last_error: row.get("last_error"),
            });
        }

        Ok(SyncState::from_entries(entries))
    }

    pub async fn get_entry(&self, path: &str) -> Result<Option<SyncEntry>> {
        // Small tables; reuse the full loader's row mapping.
        let state = self.load_sync_state().await?;
        Ok(state.get(path).cloned())
    }

    /// Record the ids about to be upserted for `doc`, merged with any ids
    /// still pending from an earlier attempt. Marks the entry incomplete.
    pub async fn stage(&self, doc: &Document, ids: &[String]) -> Result<()> {
        let existing = self.get_entry(&doc.path).await?;
        let (committed, mut pending) = match existing {
            Some(entry) => (entry.chunk_ids, entry.pending_ids),
            None => (Vec::new(), Vec::new()),
        };
        for id in ids {
            if !pending.contains(id) {
                pending.push(id.clone());
            }
        }

        self.write_entry(doc, &committed, &pending, false, None)
            .await
    }

    /// Finalize `doc` after its upserts and stale deletions succeeded.
    pub async fn commit(
        &self,
        doc: &Document,
        chunk_ids: &[String],
        complete: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.write_entry(doc, chunk_ids, &[], complete, error).await
    }

    /// Mark `doc` as failed without touching the ids it already owns.
    pub async fn mark_failed(&self, doc: &Document, error: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sync_documents
                (collection, path, fingerprint, mtime, size, format, chunk_ids, pending_ids,
                 complete, synced_at, last_error)
            VALUES (?, ?, ?, ?, ?, ?, '[]', '[]', 0, ?, ?)
            ON CONFLICT(collection, path) DO UPDATE SET
                complete = 0,
                last_error = excluded.last_error
            "#,
        )
        .bind(&self.collection)
        .bind(&doc.path)
        .bind(&doc.fingerprint)
        .bind(doc.mtime)
        .bind(doc.size as i64)
        .bind(doc.format.as_str())
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_documents WHERE collection = ? AND path = ?")
            .bind(&self.collection)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_entry(
        &self,
        doc: &Document,
        chunk_ids: &[String],
        pending_ids: &[String],
        complete: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sync_documents
                (collection, path, fingerprint, mtime, size, format, chunk_ids, pending_ids,
                 complete, synced_at, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, path) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                mtime = excluded.mtime,
                size = excluded.size,
                format = excluded.format,
                chunk_ids = excluded.chunk_ids,
                pending_ids = excluded.pending_ids,
                complete = excluded.complete,
                synced_at = excluded.synced_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&self.collection)
        .bind(&doc.path)
        .bind(&doc.fingerprint)
        .bind(doc.mtime)
        .bind(doc.size as i64)
        .bind(doc.format.as_str())
        .bind(ids_to_json(chunk_ids)?)
        .bind(ids_to_json(pending_ids)?)
        .bind(complete as i64)
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Documents whose latest content is fully indexed.
    pub async fn documents_indexed(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_documents WHERE collection = ? AND complete = 1",
        )
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Documents awaiting reconciliation after a failure.
    pub async fn documents_failed(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_documents WHERE collection = ? AND complete = 0",
        )
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    // ============ Embedding model ============

    pub async fn load_model(&self) -> Result<Option<CollectionModel>> {
        let row = sqlx::query("SELECT model, dims FROM collections WHERE collection = ?")
            .bind(&self.collection)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| CollectionModel {
            model: row.get("model"),
            dims: row.get::<i64, _>("dims").max(0) as usize,
        }))
    }

    /// Remember the model of a collection's first write. An existing record
    /// is never replaced.
    pub async fn record_model(&self, model: &str, dims: usize) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collections (collection, model, dims, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(collection) DO NOTHING
            "#,
        )
        .bind(&self.collection)
        .bind(model)
        .bind(dims as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fail with [`BackendError::Model`] or [`BackendError::Dimension`] when
    /// the collection was indexed with a different embedding model.
    pub async fn check_model(&self, model: &str, dims: usize) -> Result<()> {
        let Some(recorded) = self.load_model().await? else {
            return Ok(());
        };
        if recorded.model != model {
            return Err(BackendError::Model {
                indexed: recorded.model,
                configured: model.to_string(),
            }
            .into());
        }
        if recorded.dims != dims {
            return Err(BackendError::Dimension {
                expected: recorded.dims,
                actual: dims,
            }
            .into());
        }
        Ok(())
    }

    // ============ Schedule records ============

    pub async fn load_schedule(&self, job: Job) -> Result<ScheduleRecord> {
        let row = sqlx::query(
            r#"
            SELECT last_success_at, last_run_id, last_attempt_at, last_error
            FROM schedule_records
            WHERE collection = ? AND job = ?
            "#,
        )
        .bind(&self.collection)
        .bind(job.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => ScheduleRecord {
                job,
                last_success_at: to_datetime(row.get("last_success_at")),
                last_run_id: row.get("last_run_id"),
                last_attempt_at: to_datetime(row.get("last_attempt_at")),
                last_error: row.get("last_error"),
            },
            None => ScheduleRecord::never_run(job),
        })
    }

    pub async fn save_schedule(&self, record: &ScheduleRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_records
                (collection, job, last_success_at, last_run_id, last_attempt_at, last_error)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, job) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_run_id = excluded.last_run_id,
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&self.collection)
        .bind(record.job.as_str())
        .bind(record.last_success_at.map(|t| t.timestamp()))
        .bind(&record.last_run_id)
        .bind(record.last_attempt_at.map(|t| t.timestamp()))
        .bind(&record.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Run history ============

    pub async fn save_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (id, collection, started_at, finished_at, status, documents_indexed,
                 documents_failed, documents_removed, chunks_upserted, chunks_deleted,
                 chunks_failed, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                status = excluded.status,
                documents_indexed = excluded.documents_indexed,
                documents_failed = excluded.documents_failed,
                documents_removed = excluded.documents_removed,
                chunks_upserted = excluded.chunks_upserted,
                chunks_deleted = excluded.chunks_deleted,
                chunks_failed = excluded.chunks_failed,
                error = excluded.error
            "#,
        )
        .bind(&run.id)
        .bind(&self.collection)
        .bind(run.started_at.timestamp())
        .bind(run.finished_at.map(|t| t.timestamp()))
        .bind(run.status.as_str())
        .bind(run.documents_indexed as i64)
        .bind(run.documents_failed as i64)
        .bind(run.documents_removed as i64)
        .bind(run.chunks_upserted as i64)
        .bind(run.chunks_deleted as i64)
        .bind(run.chunks_failed as i64)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_run(&self) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, started_at, finished_at, status, documents_indexed, documents_failed,
                   documents_removed, chunks_upserted, chunks_deleted, chunks_failed, error
            FROM sync_runs
            WHERE collection = ?
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(&self.collection)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.get("status");
        let count = |name: &str| -> u64 { row.get::<i64, _>(name).max(0) as u64 };
        Ok(Some(RunRecord {
            id: row.get("id"),
            started_at: to_datetime(Some(row.get("started_at"))).unwrap_or_default(),
            finished_at: to_datetime(row.get("finished_at")),
            status: RunStatus::parse(&status),
            documents_indexed: count("documents_indexed"),
            documents_failed: count("documents_failed"),
            documents_removed: count("documents_removed"),
            chunks_upserted: count("chunks_upserted"),
            chunks_deleted: count("chunks_deleted"),
            chunks_failed: count("chunks_failed"),
            error: row.get("error"),
        }))
    }
}

// ============ Single-writer task ============

type Ack = oneshot::Sender<Result<()>>;

enum StateCommand {
    Stage {
        doc: Document,
        ids: Vec<String>,
        ack: Ack,
    },
    Commit {
        doc: Document,
        chunk_ids: Vec<String>,
        complete: bool,
        error: Option<String>,
        ack: Ack,
    },
    Fail {
        doc: Document,
        error: String,
        ack: Ack,
    },
    Remove {
        path: String,
        ack: Ack,
    },
}

/// Handle to the task that owns all sync-entry writes during a run.
///
/// Cloned into every pipeline worker. The task exits once every handle has
/// been dropped.
#[derive(Clone)]
pub struct StateWriter {
    tx: mpsc::Sender<StateCommand>,
}

impl StateWriter {
    pub fn spawn(store: StateStore) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StateCommand>(64);
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    StateCommand::Stage { doc, ids, ack } => {
                        let _ = ack.send(store.stage(&doc, &ids).await);
                    }
                    StateCommand::Commit {
                        doc,
                        chunk_ids,
                        complete,
                        error,
                        ack,
                    } => {
                        let result = store
                            .commit(&doc, &chunk_ids, complete, error.as_deref())
                            .await;
                        let _ = ack.send(result);
                    }
                    StateCommand::Fail { doc, error, ack } => {
                        let _ = ack.send(store.mark_failed(&doc, &error).await);
                    }
                    StateCommand::Remove { path, ack } => {
                        let _ = ack.send(store.remove(&path).await);
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    async fn send(&self, build: impl FnOnce(Ack) -> StateCommand) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(build(ack))
            .await
            .map_err(|_| anyhow!("state writer stopped"))?;
        done.await.map_err(|_| anyhow!("state writer dropped request"))?
    }

    pub async fn stage(&self, doc: &Document, ids: Vec<String>) -> Result<()> {
        let doc = doc.clone();
        self.send(|ack| StateCommand::Stage { doc, ids, ack }).await
    }

    pub async fn commit(
        &self,
        doc: &Document,
        chunk_ids: Vec<String>,
        complete: bool,
        error: Option<String>,
    ) -> Result<()> {
        let doc = doc.clone();
        self.send(|ack| StateCommand::Commit {
            doc,
            chunk_ids,
            complete,
            error,
            ack,
        })
        .await
    }

    pub async fn fail(&self, doc: &Document, error: impl Into<String>) -> Result<()> {
        let doc = doc.clone();
        let error = error.into();
        self.send(|ack| StateCommand::Fail { doc, error, ack }).await
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.send(|ack| StateCommand::Remove { path, ack }).await
    }
}
