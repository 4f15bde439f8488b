//! End-to-end tests for the sync, retrieval and summary paths.
//!
//! Everything runs against a real corpus directory and SQLite state
//! database, with the in-memory vector store and a keyword embedder
//! standing in for the remote backends.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use knowledge_assistant::composer::no_recent_notes;
use knowledge_assistant::config::{parse_config, Config};
use knowledge_assistant::embedding::EmbeddingBackend;
use knowledge_assistant::error::BackendError;
use knowledge_assistant::scheduler::{JobOutput, SchedulerOptions};
use knowledge_assistant::service::{KnowledgeBase, KnowledgeService};
use knowledge_assistant::state::{Job, RunStatus};
use knowledge_assistant::sync::{CancelFlag, SyncReport};
use knowledge_assistant::vector_store::{InMemoryVectorStore, VectorStore};
use knowledge_assistant::{db, migrate};
use tempfile::TempDir;

// ─── Test Embedder ──────────────────────────────────────────────────

/// Three dimensions: "rust", "garden", and a constant bias so no vector is
/// zero. Texts containing `POISON` fail while `poisoned` is set; every call
/// fails while `down` is set.
struct Keywords {
    model: &'static str,
    returned_dims: usize,
    down: AtomicBool,
    poisoned: AtomicBool,
    texts: AtomicUsize,
}

impl Keywords {
    fn new() -> Arc<Self> {
        Self::with("keywords", 3)
    }

    /// Declares 3 dimensions but answers with `returned_dims`.
    fn with(model: &'static str, returned_dims: usize) -> Arc<Self> {
        Arc::new(Self {
            model,
            returned_dims,
            down: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            texts: AtomicUsize::new(0),
        })
    }

    fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingBackend for Keywords {
    fn model_name(&self) -> &str {
        self.model
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::transport("keywords", "connection refused"));
        }
        if self.poisoned.load(Ordering::SeqCst) && texts.iter().any(|t| t.contains("POISON")) {
            return Err(BackendError::Status {
                backend: "keywords",
                status: 503,
                body: "poisoned input".to_string(),
            });
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                let mut v = vec![
                    if t.contains("rust") { 1.0 } else { 0.0 },
                    if t.contains("garden") { 1.0 } else { 0.0 },
                ];
                v.resize(self.returned_dims, 0.1);
                v
            })
            .collect())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    config: Config,
    notes: PathBuf,
    summaries: PathBuf,
    store: Arc<InMemoryVectorStore>,
    embedder: Arc<Keywords>,
    base: KnowledgeBase,
}

fn test_config(root: &Path, max_tokens: usize, token_budget: usize) -> Config {
    let toml = format!(
        r#"
[db]
path = '{db}'

[corpus]
root = '{notes}'

[chunking]
max_tokens = {max_tokens}
overlap_tokens = 0

[embedding]
dims = 3

[vector_store]
provider = "memory"
collection = "notes"
write_batch_size = 4

[generation]
provider = "disabled"

[retrieval]
top_k = 5
token_budget = {token_budget}

[retry]
max_attempts = 2
initial_backoff_ms = 1
max_backoff_ms = 1

[summaries]
dir = '{summaries}'
"#,
        db = root.join("data/pka.sqlite").display(),
        notes = root.join("notes").display(),
        summaries = root.join("summaries").display(),
    );
    parse_config(&toml).unwrap()
}

async fn harness(max_tokens: usize, token_budget: usize) -> Harness {
    harness_with(Keywords::new(), max_tokens, token_budget).await
}

async fn harness_with(embedder: Arc<Keywords>, max_tokens: usize, token_budget: usize) -> Harness {
    let tmp = TempDir::new().unwrap();
    let notes = tmp.path().join("notes");
    std::fs::create_dir_all(&notes).unwrap();
    let config = test_config(tmp.path(), max_tokens, token_budget);

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = Arc::new(InMemoryVectorStore::new());
    let base = KnowledgeBase::from_parts(&config, pool, embedder.clone(), store.clone(), None);

    Harness {
        summaries: tmp.path().join("summaries"),
        _tmp: tmp,
        config,
        notes,
        store,
        embedder,
        base,
    }
}

impl Harness {
    fn write(&self, name: &str, body: &str) {
        std::fs::write(self.notes.join(name), body).unwrap();
    }

    async fn sync(&self, run_id: &str) -> SyncReport {
        self.base.sync(run_id, &CancelFlag::new()).await.unwrap()
    }

    /// Same database and vector store, another embedding backend.
    fn reopen(&self, embedder: Arc<Keywords>) -> KnowledgeBase {
        let pool = self.base.state().pool().clone();
        KnowledgeBase::from_parts(&self.config, pool, embedder, self.store.clone(), None)
    }

    fn ids(&self) -> Vec<String> {
        self.store.ids("notes")
    }

    fn ids_for(&self, path: &str) -> Vec<String> {
        self.ids()
            .into_iter()
            .filter(|id| {
                self.store
                    .get("notes", id)
                    .map(|p| p.payload.path == path)
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Ten paragraphs that chunk one per window at `max_tokens = 10`.
fn ten_paragraphs(poison_at: usize) -> String {
    (0..10)
        .map(|i| {
            if i == poison_at {
                format!("Paragraph {:02} holds POISON {:02}.", i, i)
            } else {
                format!("Paragraph {:02} covers item {:02}.", i, i)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Sync ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_small_document_becomes_one_point() {
    let h = harness(250, 1500).await;
    // About 50 tokens.
    h.write(
        "rust.md",
        "Rust notes: ownership moves values, borrowing lends them, and lifetimes \
         tie references to the data they point at. Cargo builds it all.",
    );

    let report = h.sync("run-1").await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.documents_indexed, 1);
    assert_eq!(report.chunks_upserted, 1);
    assert!(report.documents_failed.is_empty());

    let ids = h.ids();
    assert_eq!(ids.len(), 1);
    let point = h.store.get("notes", &ids[0]).unwrap();
    assert_eq!(point.payload.path, "rust.md");
    assert_eq!(point.payload.ordinal, 0);
    assert!(point.payload.text.starts_with("Rust notes:"));

    let entry = h.base.state().get_entry("rust.md").await.unwrap().unwrap();
    assert!(entry.complete);
    assert_eq!(entry.chunk_ids, ids);
    assert!(entry.pending_ids.is_empty());
}

#[tokio::test]
async fn test_rerun_without_changes_writes_nothing() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    h.write("garden.md", "Garden planting schedule for tomatoes.");

    let first = h.sync("run-1").await;
    assert_eq!(first.documents_indexed, 2);
    let writes = h.store.write_count();
    let embedded = h.embedder.texts_embedded();
    let ids = h.ids();

    let second = h.sync("run-2").await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.documents_indexed, 0);
    assert_eq!(second.documents_unchanged, 2);
    assert_eq!(second.chunks_upserted, 0);
    assert_eq!(second.chunks_deleted, 0);
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.embedder.texts_embedded(), embedded);
    assert_eq!(h.ids(), ids);
}

#[tokio::test]
async fn test_edited_document_replaces_its_points() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    h.write("garden.md", "Garden planting schedule for tomatoes.");
    h.sync("run-1").await;

    let old_rust = h.ids_for("rust.md");
    let garden = h.ids_for("garden.md");
    assert_eq!(old_rust.len(), 1);

    h.write("rust.md", "Rust async notes: futures are lazy until polled.");
    let report = h.sync("run-2").await;
    assert_eq!(report.documents_indexed, 1);
    assert_eq!(report.documents_unchanged, 1);
    assert_eq!(report.chunks_upserted, 1);
    assert_eq!(report.chunks_deleted, 1);

    let new_rust = h.ids_for("rust.md");
    assert_eq!(new_rust.len(), 1);
    assert_ne!(new_rust, old_rust);
    assert!(h.store.get("notes", &old_rust[0]).is_none());
    assert_eq!(h.ids_for("garden.md"), garden);

    let point = h.store.get("notes", &new_rust[0]).unwrap();
    assert!(point.payload.text.contains("futures are lazy"));
}

#[tokio::test]
async fn test_deleted_document_loses_points_and_state() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    h.write("garden.md", "Garden planting schedule for tomatoes.");
    h.sync("run-1").await;
    let garden = h.ids_for("garden.md");

    std::fs::remove_file(h.notes.join("rust.md")).unwrap();
    let report = h.sync("run-2").await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.documents_removed, 1);
    assert_eq!(report.chunks_deleted, 1);

    assert!(h.ids_for("rust.md").is_empty());
    assert_eq!(h.ids(), garden);
    assert!(h.base.state().get_entry("rust.md").await.unwrap().is_none());
    assert_eq!(h.base.state().documents_indexed().await.unwrap(), 1);
}

#[tokio::test]
async fn test_one_failed_chunk_is_isolated_then_retried_alone() {
    let h = harness(10, 1500).await;
    h.write("long.md", &ten_paragraphs(7));
    h.embedder.poisoned.store(true, Ordering::SeqCst);

    let report = h.sync("run-1").await;
    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.documents_indexed, 1);
    assert_eq!(report.chunks_upserted, 9);
    assert_eq!(report.chunks_failed.len(), 1);
    assert_eq!(report.chunks_failed[0].path, "long.md");
    assert_eq!(report.chunks_failed[0].ordinal, 7);
    assert_eq!(h.ids().len(), 9);

    let entry = h.base.state().get_entry("long.md").await.unwrap().unwrap();
    assert!(!entry.complete);
    assert_eq!(entry.chunk_ids.len(), 9);
    assert_eq!(h.base.state().documents_failed().await.unwrap(), 1);

    let run = h.base.state().last_run().await.unwrap().unwrap();
    assert_eq!(run.id, "run-1");
    assert_eq!(run.status, RunStatus::CompletedWithFailures);
    assert_eq!(run.chunks_failed, 1);

    // The backend recovers: only the missing chunk is embedded and written,
    // next to the one text the run sends to check the backend.
    h.embedder.poisoned.store(false, Ordering::SeqCst);
    let embedded = h.embedder.texts_embedded();
    let report = h.sync("run-2").await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.documents_indexed, 1);
    assert_eq!(report.chunks_upserted, 1);
    assert_eq!(report.chunks_deleted, 0);
    assert_eq!(h.embedder.texts_embedded() - embedded, 2);
    assert_eq!(h.ids().len(), 10);

    let entry = h.base.state().get_entry("long.md").await.unwrap().unwrap();
    assert!(entry.complete);
    assert_eq!(entry.chunk_ids.len(), 10);
}

#[tokio::test]
async fn test_embedder_outage_keeps_previous_points() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    h.sync("run-1").await;
    let old = h.ids_for("rust.md");
    let writes = h.store.write_count();

    h.write("rust.md", "Rust async notes: futures are lazy until polled.");
    h.embedder.down.store(true, Ordering::SeqCst);
    let err = h.base.sync("run-2", &CancelFlag::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("connection refused"));

    assert_eq!(h.ids_for("rust.md"), old);
    assert_eq!(h.store.write_count(), writes);
    let entry = h.base.state().get_entry("rust.md").await.unwrap().unwrap();
    assert!(entry.complete);
    assert_eq!(entry.chunk_ids, old);
    let run = h.base.state().last_run().await.unwrap().unwrap();
    assert_eq!(run.id, "run-2");
    assert_eq!(run.status, RunStatus::Failed);

    h.embedder.down.store(false, Ordering::SeqCst);
    let report = h.sync("run-3").await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.chunks_deleted, 1);
    assert_ne!(h.ids_for("rust.md"), old);
}

#[tokio::test]
async fn test_document_with_every_chunk_failing_keeps_old_points() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    h.write("garden.md", "Garden planting schedule for tomatoes.");
    h.sync("run-1").await;
    let old = h.ids_for("rust.md");

    h.write("rust.md", "Rust notes that now carry POISON.");
    h.embedder.poisoned.store(true, Ordering::SeqCst);
    let report = h.sync("run-2").await;
    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.documents_indexed, 0);
    assert_eq!(report.chunks_deleted, 0);
    assert_eq!(report.documents_failed.len(), 1);
    assert_eq!(report.documents_failed[0].path, "rust.md");
    assert!(report.documents_failed[0]
        .reason
        .starts_with("all 1 chunks failed to embed"));

    assert_eq!(h.ids_for("rust.md"), old);
    let entry = h.base.state().get_entry("rust.md").await.unwrap().unwrap();
    assert!(!entry.complete);
    assert_eq!(entry.chunk_ids, old);
    assert!(entry.last_error.is_some());

    // Still answerable from the previous version until the retry lands.
    let response = h.base.ask("rust", 5).await.unwrap();
    assert_eq!(response.sources[0].path, "rust.md");

    h.embedder.poisoned.store(false, Ordering::SeqCst);
    let report = h.sync("run-3").await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.documents_indexed, 1);
    assert_eq!(report.chunks_deleted, 1);
    let new = h.ids_for("rust.md");
    assert_eq!(new.len(), 1);
    assert_ne!(new, old);
}

#[tokio::test]
async fn test_wrong_backend_dimension_fails_before_any_write() {
    let h = harness_with(Keywords::with("keywords", 5), 250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");

    let err = h.base.sync("run-1", &CancelFlag::new()).await.unwrap_err();
    let dims = err
        .chain()
        .find_map(|e| e.downcast_ref::<BackendError>())
        .cloned();
    assert!(matches!(
        dims,
        Some(BackendError::Dimension {
            expected: 3,
            actual: 5
        })
    ));

    assert_eq!(h.store.collection_dims("notes").await.unwrap(), None);
    assert_eq!(h.store.write_count(), 0);
    assert!(h.base.state().get_entry("rust.md").await.unwrap().is_none());
    assert!(h.base.state().load_model().await.unwrap().is_none());
}

#[tokio::test]
async fn test_switching_embedding_model_is_rejected() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    h.sync("run-1").await;
    let writes = h.store.write_count();

    let other = h.reopen(Keywords::with("other-model", 3));
    let is_model_error = |err: &anyhow::Error| {
        err.chain().any(|e| {
            matches!(
                e.downcast_ref::<BackendError>(),
                Some(BackendError::Model { .. })
            )
        })
    };

    let err = other.sync("run-2", &CancelFlag::new()).await.unwrap_err();
    assert!(is_model_error(&err));
    assert!(format!("{:#}", err).contains("'keywords'"));
    let err = other.ask("rust", 5).await.unwrap_err();
    assert!(is_model_error(&err));
    assert_eq!(h.store.write_count(), writes);

    // The original model keeps working.
    assert!(!h.base.ask("rust", 5).await.unwrap().sources.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start_indexes_nothing() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = h.base.sync("run-1", &cancel).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.documents_indexed, 0);
    assert!(h.ids().is_empty());
}

// ─── Retrieval and composition ──────────────────────────────────────

#[tokio::test]
async fn test_ask_respects_budget_and_cites_sources() {
    // Room for one rendered passage only.
    let h = harness(250, 40).await;
    h.write("rust-a.md", "Rust ownership: every value has a single owner at a time.");
    h.write("rust-b.md", "Rust borrowing: shared or mutable references, never both.");
    h.write("garden.md", "Garden: water the tomatoes every morning in July.");
    h.sync("run-1").await;

    let response = h.base.ask("rust", 5).await.unwrap();
    assert_eq!(response.question, "rust");
    assert!(response.truncated);
    assert_eq!(response.sources.len(), 1);
    // Equal scores fall back to path order.
    assert_eq!(response.sources[0].path, "rust-a.md");
    assert!(response.sources[0].score > 0.9);
    assert!(!response.generated);
    assert!(response.answer.contains("rust-a.md"));
}

#[tokio::test]
async fn test_ask_on_empty_index_says_nothing_found() {
    let h = harness(250, 1500).await;
    let response = h.base.ask("anything at all", 5).await.unwrap();
    assert!(response.sources.is_empty());
    assert!(!response.generated);
    assert_eq!(
        response.answer,
        "I couldn't find any relevant information to answer your question."
    );
}

#[tokio::test]
async fn test_summary_covers_recent_notes_and_is_saved() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    h.write("garden.md", "Garden planting schedule for tomatoes.");
    h.sync("run-1").await;

    let summary = h.base.summarize(1).await.unwrap();
    assert_eq!(summary.notes, 2);
    assert!(!summary.generated);

    let path = summary.path.unwrap();
    assert!(path.starts_with(&h.summaries));
    let body = std::fs::read_to_string(&path).unwrap();
    assert!(body.starts_with("# Daily Summary - "));
    assert!(body.contains("garden.md"));
    assert!(body.contains("rust.md"));

}

#[tokio::test]
async fn test_summary_context_uses_front_matter_titles() {
    let h = harness(250, 1500).await;
    h.write(
        "weekly.md",
        "---\ntitle: Weekly review\n---\nGarden beds are planted.",
    );
    h.sync("run-1").await;

    let since = chrono::Utc::now() - chrono::Duration::hours(1);
    let context = h.base.retrieval().recent(since).await.unwrap();
    assert!(context
        .context
        .starts_with("--- Note 1: Weekly review ---\nSource: weekly.md\n"));
}

#[tokio::test]
async fn test_empty_summary_names_the_lookback_window() {
    let h = harness(250, 1500).await;
    let empty = h.base.summarize(6).await.unwrap();
    assert_eq!(empty.notes, 0);
    assert!(!empty.generated);
    assert_eq!(empty.text, no_recent_notes(6));
    assert_eq!(empty.text, "No new or updated notes in the last 6 hours.");
    assert!(empty.path.unwrap().exists());
}

// ─── Scheduler ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_manual_sync_through_scheduler_updates_status() {
    let h = harness(250, 1500).await;
    h.write("rust.md", "Rust borrow checker notes.");
    let Harness {
        _tmp, base, store, ..
    } = h;

    let options = SchedulerOptions {
        tick: Duration::from_secs(3600),
        timer: false,
    };
    let service = KnowledgeService::with_base(Arc::new(base), options)
        .await
        .unwrap();

    let done = service.scheduler().run_and_wait(Job::Sync).await.unwrap();
    assert_eq!(done.job, Job::Sync);
    match done.outcome {
        Ok(JobOutput::Sync(report)) => {
            assert_eq!(report.run_id, done.run_id);
            assert_eq!(report.documents_indexed, 1);
        }
        other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
    }
    assert_eq!(store.ids("notes").len(), 1);

    let status = service.status().await.unwrap();
    assert_eq!(status.collection, "notes");
    assert_eq!(status.documents_indexed, 1);
    assert_eq!(status.documents_failed, 0);
    assert_eq!(status.points, Some(1));
    assert_eq!(status.embedding_model.as_deref(), Some("keywords"));
    assert!(status.last_sync_time.is_some());
    assert!(status.last_summary_time.is_none());
    assert_eq!(status.last_run.unwrap().id, done.run_id);

    service.shutdown().await.unwrap();
}
