//! Knowledge service: the assembled system behind the CLI and HTTP server.
//!
//! [`KnowledgeBase`] wires configuration into the sync pipeline, retrieval
//! engine and composer, and runs jobs. [`KnowledgeService`] puts the
//! scheduler in front of it and exposes the public operations:
//!
//! | Operation | Result |
//! |-----------|--------|
//! | [`KnowledgeService::trigger_sync`] | run id (new, or the pending one when a sync is running) |
//! | [`KnowledgeService::trigger_summary`] | run id, same coalescing |
//! | [`KnowledgeService::status`] | last job times, document and point counts, pending run |
//! | [`KnowledgeService::ask`] | answer plus `(path, chunk_id, score)` sources |

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::composer::{Composer, SummaryReport};
use crate::config::Config;
use crate::embedding::{create_backend, EmbeddingBackend};
use crate::extract::LocalExtractor;
use crate::generation::{create_generator, GenerationBackend};
use crate::orchestrator::EmbeddingOrchestrator;
use crate::retrieval::RetrievalEngine;
use crate::retry::RetryPolicy;
use crate::scheduler::{
    start_scheduler, JobOutput, JobRunner, JobStatus, Request, SchedulerHandle, SchedulerOptions,
    SchedulerState,
};
use crate::state::{Job, RunStatus, StateStore};
use crate::sync::{CancelFlag, SyncPipeline, SyncReport, Synchronizer};
use crate::vector_store::{create_store, QueryFilter, VectorStore};
use crate::{db, migrate};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub path: String,
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub question: String,
    pub answer: String,
    pub generated: bool,
    pub sources: Vec<Source>,
    /// True when lower-ranked passages were left out of the prompt.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub documents_indexed: u64,
    pub documents_failed: u64,
    pub chunks_failed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub collection: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_summary_time: Option<DateTime<Utc>>,
    /// Embedding model the collection was built with.
    pub embedding_model: Option<String>,
    pub documents_indexed: u64,
    pub documents_failed: u64,
    /// Points in the vector store; `None` when the store was not asked.
    pub points: Option<u64>,
    pub pending_run: Option<String>,
    pub last_run: Option<LastRun>,
    pub jobs: Vec<JobStatus>,
}

/// Open the state database and bring its schema up to date.
pub async fn open_state(config: &Config) -> Result<StateStore> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    Ok(StateStore::new(pool, config.vector_store.collection.clone()))
}

/// Status from the state database. `jobs` comes from a live scheduler when
/// one is running; otherwise the persisted schedule records are used.
pub async fn load_status(state: &StateStore, jobs: Vec<JobStatus>) -> Result<Status> {
    let (last_sync_time, last_summary_time) = if jobs.is_empty() {
        (
            state.load_schedule(Job::Sync).await?.last_success_at,
            state.load_schedule(Job::Summary).await?.last_success_at,
        )
    } else {
        let success = |name: &str| {
            jobs.iter()
                .find(|j| j.job == name)
                .and_then(|j| j.last_success_at)
        };
        (success("sync"), success("summary"))
    };

    let pending_run = jobs.iter().find_map(|j| j.pending_run.clone());
    let last_run = state.last_run().await?.map(|run| LastRun {
        id: run.id,
        status: run.status.as_str().to_string(),
        started_at: run.started_at,
        finished_at: run.finished_at,
        documents_indexed: run.documents_indexed,
        documents_failed: run.documents_failed,
        chunks_failed: run.chunks_failed,
        error: run.error,
    });

    Ok(Status {
        collection: state.collection().to_string(),
        last_sync_time,
        last_summary_time,
        embedding_model: state.load_model().await?.map(|m| m.model),
        documents_indexed: state.documents_indexed().await?,
        documents_failed: state.documents_failed().await?,
        points: None,
        pending_run,
        last_run,
        jobs,
    })
}

// ============ KnowledgeBase ============

pub struct KnowledgeBase {
    config: Config,
    state: StateStore,
    pipeline: SyncPipeline,
    retrieval: RetrievalEngine,
    composer: Composer,
}

impl KnowledgeBase {
    /// Build every component from configuration.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let embedder = create_backend(&config.embedding)?;
        let store = create_store(&config.vector_store)?;
        let generator = create_generator(&config.generation)?;
        Ok(Self::from_parts(config, pool, embedder, store, generator))
    }

    /// Assemble from already constructed backends.
    pub fn from_parts(
        config: &Config,
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingBackend>,
        store: Arc<dyn VectorStore>,
        generator: Option<Arc<dyn GenerationBackend>>,
    ) -> Self {
        let state = StateStore::new(pool, config.vector_store.collection.clone());
        let policy = RetryPolicy::from_config(&config.retry);
        let orchestrator = EmbeddingOrchestrator::new(
            embedder,
            &config.embedding,
            policy
                .clone()
                .with_timeout(std::time::Duration::from_secs(config.embedding.timeout_secs)),
        );
        let store_policy = policy.with_timeout(std::time::Duration::from_secs(
            config.vector_store.timeout_secs,
        ));
        let synchronizer =
            Synchronizer::new(Arc::clone(&store), &config.vector_store, store_policy.clone());
        let pipeline = SyncPipeline {
            corpus: config.corpus.clone(),
            chunking: config.chunking.clone(),
            workers: config.sync.workers,
            state: state.clone(),
            extractor: Arc::new(LocalExtractor),
            orchestrator: orchestrator.clone(),
            synchronizer,
        };
        let retrieval = RetrievalEngine::new(
            orchestrator,
            store,
            config.vector_store.collection.clone(),
            &config.retrieval,
            store_policy,
        );
        let composer = Composer::new(
            generator,
            &config.generation,
            &config.retry,
            config.summaries.dir.clone(),
        );

        Self {
            config: config.clone(),
            state,
            pipeline,
            retrieval,
            composer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    pub async fn sync(&self, run_id: &str, cancel: &CancelFlag) -> Result<SyncReport> {
        self.pipeline.run(run_id, cancel).await
    }

    /// Fail when the configured embedding model is not the one the
    /// collection was indexed with.
    async fn check_model(&self) -> Result<()> {
        let orchestrator = &self.pipeline.orchestrator;
        self.state
            .check_model(orchestrator.model_name(), orchestrator.dims())
            .await
    }

    /// Points currently in the collection.
    pub async fn point_count(&self) -> Result<u64> {
        Ok(self.pipeline.synchronizer.point_count().await?)
    }

    /// Summarize notes indexed during the last `lookback_hours` and save
    /// the summary file.
    pub async fn summarize(&self, lookback_hours: u64) -> Result<SummaryReport> {
        self.check_model().await?;
        let since = Utc::now() - chrono::Duration::hours(lookback_hours as i64);
        let context = self
            .retrieval
            .recent(since)
            .await
            .context("retrieving recent notes")?;
        let summary = self
            .composer
            .summarize(&context, lookback_hours)
            .await
            .context("generating summary")?;
        let path = self.composer.save_summary(&summary.text, Local::now())?;
        Ok(SummaryReport {
            text: summary.text,
            generated: summary.generated,
            notes: context.passages.len(),
            path: Some(path),
        })
    }

    pub async fn ask(&self, query: &str, k: usize) -> Result<AskResponse> {
        self.ask_filtered(query, k, &QueryFilter::default()).await
    }

    pub async fn ask_filtered(
        &self,
        query: &str,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<AskResponse> {
        self.check_model().await?;
        let context = self
            .retrieval
            .retrieve(query, k, filter)
            .await
            .context("retrieving context")?;
        let answer = self
            .composer
            .answer(query, &context)
            .await
            .context("generating answer")?;
        Ok(AskResponse {
            question: query.to_string(),
            answer: answer.text,
            generated: answer.generated,
            sources: context
                .passages
                .iter()
                .map(|p| Source {
                    path: p.path.clone(),
                    chunk_id: p.chunk_id.clone(),
                    score: p.score,
                })
                .collect(),
            truncated: context.truncated,
        })
    }
}

#[async_trait]
impl JobRunner for KnowledgeBase {
    async fn run_job(&self, job: Job, run_id: &str, cancel: CancelFlag) -> Result<JobOutput> {
        match job {
            Job::Sync => {
                let report = self.sync(run_id, &cancel).await?;
                if report.status == RunStatus::Cancelled {
                    bail!("sync run {} was cancelled", run_id);
                }
                Ok(JobOutput::Sync(report))
            }
            Job::Summary => {
                let report = self
                    .summarize(self.config.scheduler.summary_lookback_hours)
                    .await?;
                Ok(JobOutput::Summary(report))
            }
        }
    }
}

// ============ KnowledgeService ============

pub struct KnowledgeService {
    base: Arc<KnowledgeBase>,
    scheduler: SchedulerHandle,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl KnowledgeService {
    pub async fn start(config: &Config, options: SchedulerOptions) -> Result<Self> {
        let base = Arc::new(KnowledgeBase::open(config).await?);
        Self::with_base(base, options).await
    }

    pub async fn with_base(base: Arc<KnowledgeBase>, options: SchedulerOptions) -> Result<Self> {
        let state = SchedulerState::load(base.state().clone(), &base.config().scheduler).await?;
        let runner: Arc<dyn JobRunner> = base.clone();
        let (scheduler, task) = start_scheduler(state, runner, options);
        Ok(Self {
            base,
            scheduler,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn base(&self) -> &Arc<KnowledgeBase> {
        &self.base
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub async fn trigger_sync(&self) -> Result<String> {
        Ok(self.trigger(Job::Sync).await?.run_id().to_string())
    }

    pub async fn trigger_summary(&self) -> Result<String> {
        Ok(self.trigger(Job::Summary).await?.run_id().to_string())
    }

    async fn trigger(&self, job: Job) -> Result<Request> {
        let request = self.scheduler.trigger(job).await?;
        tracing::info!(%job, run_id = %request.run_id(), "job triggered");
        Ok(request)
    }

    pub async fn status(&self) -> Result<Status> {
        let jobs = self.scheduler.jobs().await?;
        let mut status = load_status(self.base.state(), jobs).await?;
        match self.base.point_count().await {
            Ok(points) => status.points = Some(points),
            Err(err) => tracing::warn!(error = %format!("{:#}", err), "failed to count points"),
        }
        Ok(status)
    }

    pub async fn ask(&self, query: &str, k: usize) -> Result<AskResponse> {
        self.base.ask(query, k).await
    }

    /// Stop the scheduler, wait for in-flight runs and flush its state.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await.context("scheduler task panicked")??;
        }
        Ok(())
    }
}
