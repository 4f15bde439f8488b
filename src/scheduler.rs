//! Job scheduler.
//!
//! Drives the `sync` and `summary` jobs on their configured intervals and
//! accepts manual triggers. Each job moves through
//!
//! ```text
//! IDLE ──(interval elapsed | trigger)──► DUE ──► RUNNING ──► IDLE
//! ```
//!
//! | Rule | Behavior |
//! |------|----------|
//! | never run | due on the first tick |
//! | at most one run | a trigger or due tick while RUNNING becomes the job's single pending run |
//! | coalescing | every further request returns that same pending run id |
//! | after a run | the pending run, if any, starts exactly once |
//! | success only | `last_success_at` advances (and is persisted) only when the run succeeds |
//!
//! While a job runs, due-ness is measured from the later of the last
//! success and the current run's start, so a tick only queues a follow-up
//! when the running job has already outlasted its interval.
//!
//! [`SchedulerState`] is loaded from the persisted [`ScheduleRecord`]s and
//! flushed back on shutdown. The loop itself is a `tokio::select!` over the
//! tick timer, finished runs and the control channel; runs execute in their
//! own tasks so triggers are answered while a job is busy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::composer::SummaryReport;
use crate::config::SchedulerConfig;
use crate::state::{Job, ScheduleRecord, StateStore};
use crate::sync::{CancelFlag, SyncReport};

const JOBS: [Job; 2] = [Job::Sync, Job::Summary];

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobOutput {
    Sync(SyncReport),
    Summary(SummaryReport),
}

/// Executes scheduled jobs. Implemented by the knowledge service.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_job(&self, job: Job, run_id: &str, cancel: CancelFlag) -> Result<JobOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Due,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: &'static str,
    pub phase: JobPhase,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub running_run: Option<String>,
    pub pending_run: Option<String>,
}

/// Result of asking for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// The job was idle and starts now under this id.
    Start(String),
    /// The job is running; the request joined its pending run.
    Coalesced(String),
}

impl Request {
    pub fn run_id(&self) -> &str {
        match self {
            Request::Start(id) | Request::Coalesced(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunFinished {
    pub job: Job,
    pub run_id: String,
    pub outcome: Result<JobOutput, String>,
}

// ============ State ============

#[derive(Debug)]
struct JobSlot {
    record: ScheduleRecord,
    interval: chrono::Duration,
    running: Option<(String, DateTime<Utc>)>,
    pending: Option<String>,
}

/// Per-job scheduling state, loaded from and flushed to the state database.
#[derive(Debug)]
pub struct SchedulerState {
    store: StateStore,
    slots: [JobSlot; 2],
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

fn slot_index(job: Job) -> usize {
    match job {
        Job::Sync => 0,
        Job::Summary => 1,
    }
}

impl SchedulerState {
    pub async fn load(store: StateStore, config: &SchedulerConfig) -> Result<Self> {
        let slot = |record: ScheduleRecord, interval_secs: u64| JobSlot {
            record,
            interval: chrono::Duration::seconds(interval_secs as i64),
            running: None,
            pending: None,
        };
        let slots = [
            slot(
                store.load_schedule(Job::Sync).await?,
                config.sync_interval_secs,
            ),
            slot(
                store.load_schedule(Job::Summary).await?,
                config.summary_interval_secs,
            ),
        ];
        Ok(Self { store, slots })
    }

    /// Persist every job's record.
    pub async fn flush(&self) -> Result<()> {
        for slot in &self.slots {
            self.store.save_schedule(&slot.record).await?;
        }
        Ok(())
    }

    async fn persist(&self, job: Job) {
        if let Err(err) = self.store.save_schedule(self.record(job)).await {
            tracing::warn!(%job, error = %format!("{:#}", err), "failed to persist schedule record");
        }
    }

    fn slot(&self, job: Job) -> &JobSlot {
        &self.slots[slot_index(job)]
    }

    fn slot_mut(&mut self, job: Job) -> &mut JobSlot {
        &mut self.slots[slot_index(job)]
    }

    pub fn record(&self, job: Job) -> &ScheduleRecord {
        &self.slot(job).record
    }

    pub fn is_due(&self, job: Job, now: DateTime<Utc>) -> bool {
        let slot = self.slot(job);
        let since = match (slot.record.last_success_at, &slot.running) {
            (Some(success), Some((_, started))) => Some(success.max(*started)),
            (Some(success), None) => Some(success),
            (None, Some((_, started))) => Some(*started),
            (None, None) => None,
        };
        match since {
            Some(since) => since + slot.interval <= now,
            None => true,
        }
    }

    pub fn phase(&self, job: Job, now: DateTime<Utc>) -> JobPhase {
        if self.slot(job).running.is_some() {
            JobPhase::Running
        } else if self.is_due(job, now) {
            JobPhase::Due
        } else {
            JobPhase::Idle
        }
    }

    pub fn running_run(&self, job: Job) -> Option<&str> {
        self.slot(job).running.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn pending_run(&self, job: Job) -> Option<&str> {
        self.slot(job).pending.as_deref()
    }

    fn take_pending(&mut self, job: Job) -> Option<String> {
        self.slot_mut(job).pending.take()
    }

    /// Start `job` now, or join its pending run if it is already running.
    pub fn request(&mut self, job: Job, now: DateTime<Utc>) -> Request {
        let slot = self.slot_mut(job);
        if slot.running.is_some() {
            let id = slot.pending.get_or_insert_with(new_run_id).clone();
            return Request::Coalesced(id);
        }
        let id = new_run_id();
        self.start(job, id.clone(), now);
        Request::Start(id)
    }

    /// Mark `run_id` as the running instance of `job`.
    pub fn start(&mut self, job: Job, run_id: String, now: DateTime<Utc>) {
        let slot = self.slot_mut(job);
        slot.record.last_run_id = Some(run_id.clone());
        slot.record.last_attempt_at = Some(now);
        slot.running = Some((run_id, now));
    }

    /// Record the end of the running instance and hand back the pending
    /// run id, if one was queued. The caller decides whether to start it.
    pub fn finish(
        &mut self,
        job: Job,
        outcome: Result<(), String>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let slot = self.slot_mut(job);
        slot.running = None;
        match outcome {
            Ok(()) => {
                slot.record.last_success_at = Some(now);
                slot.record.last_error = None;
            }
            Err(err) => slot.record.last_error = Some(err),
        }
        slot.pending.take()
    }

    pub fn jobs(&self, now: DateTime<Utc>) -> Vec<JobStatus> {
        JOBS.iter()
            .map(|&job| {
                let slot = self.slot(job);
                JobStatus {
                    job: job.as_str(),
                    phase: self.phase(job, now),
                    last_success_at: slot.record.last_success_at,
                    last_attempt_at: slot.record.last_attempt_at,
                    last_error: slot.record.last_error.clone(),
                    running_run: self.running_run(job).map(str::to_string),
                    pending_run: slot.pending.clone(),
                }
            })
            .collect()
    }
}

// ============ Loop ============

enum Control {
    Trigger {
        job: Job,
        reply: oneshot::Sender<Request>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<JobStatus>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub tick: Duration,
    /// When false only manual triggers start runs.
    pub timer: bool,
}

impl SchedulerOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_secs(config.tick_secs.max(1)),
            timer: config.enabled,
        }
    }
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Control>,
    finished: broadcast::Sender<RunFinished>,
}

impl SchedulerHandle {
    pub async fn trigger(&self, job: Job) -> Result<Request> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::Trigger { job, reply })
            .await
            .map_err(|_| anyhow!("scheduler stopped"))?;
        rx.await.map_err(|_| anyhow!("scheduler stopped"))
    }

    pub async fn jobs(&self) -> Result<Vec<JobStatus>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::Jobs { reply })
            .await
            .map_err(|_| anyhow!("scheduler stopped"))?;
        rx.await.map_err(|_| anyhow!("scheduler stopped"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunFinished> {
        self.finished.subscribe()
    }

    /// Trigger `job` and wait until the resulting run finishes.
    pub async fn run_and_wait(&self, job: Job) -> Result<RunFinished> {
        let mut finished = self.subscribe();
        let request = self.trigger(job).await?;
        loop {
            match finished.recv().await {
                Ok(done) if done.run_id == request.run_id() => return Ok(done),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    bail!("scheduler stopped before run {} finished", request.run_id())
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Control::Shutdown).await;
    }
}

/// Spawn the scheduler loop. The returned task resolves once the loop has
/// shut down, in-flight runs have finished and the state was flushed.
pub fn start_scheduler(
    state: SchedulerState,
    runner: Arc<dyn JobRunner>,
    options: SchedulerOptions,
) -> (SchedulerHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(32);
    let (finished, _) = broadcast::channel(64);
    let task = tokio::spawn(scheduler_loop(state, runner, options, rx, finished.clone()));
    (SchedulerHandle { tx, finished }, task)
}

fn launch(
    running: &mut JoinSet<RunFinished>,
    runner: &Arc<dyn JobRunner>,
    cancel: &CancelFlag,
    job: Job,
    run_id: String,
) {
    tracing::info!(%job, run_id = %run_id, "job started");
    let runner = Arc::clone(runner);
    let cancel = cancel.clone();
    running.spawn(async move {
        let id = run_id.clone();
        let inner = tokio::spawn(async move { runner.run_job(job, &id, cancel).await });
        let outcome = match inner.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(join) => Err(format!("job task failed: {}", join)),
        };
        RunFinished {
            job,
            run_id,
            outcome,
        }
    });
}

async fn scheduler_loop(
    mut state: SchedulerState,
    runner: Arc<dyn JobRunner>,
    options: SchedulerOptions,
    mut rx: mpsc::Receiver<Control>,
    finished: broadcast::Sender<RunFinished>,
) -> Result<()> {
    tracing::info!(
        tick_secs = options.tick.as_secs(),
        timer = options.timer,
        "scheduler started"
    );
    let mut ticker = tokio::time::interval(options.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut running: JoinSet<RunFinished> = JoinSet::new();
    let cancel = CancelFlag::new();

    loop {
        tokio::select! {
            _ = ticker.tick(), if options.timer => {
                let now = Utc::now();
                for job in JOBS {
                    if !state.is_due(job, now) {
                        continue;
                    }
                    match state.request(job, now) {
                        Request::Start(run_id) => {
                            state.persist(job).await;
                            launch(&mut running, &runner, &cancel, job, run_id);
                        }
                        Request::Coalesced(run_id) => {
                            tracing::debug!(%job, pending = %run_id, "job still running; run queued");
                        }
                    }
                }
            }

            Some(joined) = running.join_next(), if !running.is_empty() => {
                let done = match joined {
                    Ok(done) => done,
                    Err(err) => {
                        tracing::error!(error = %err, "job supervisor task failed");
                        continue;
                    }
                };
                let now = Utc::now();
                let result = done.outcome.as_ref().map(|_| ()).map_err(Clone::clone);
                match &result {
                    Ok(()) => tracing::info!(job = %done.job, run_id = %done.run_id, "job finished"),
                    Err(err) => tracing::warn!(job = %done.job, run_id = %done.run_id, error = %err, "job failed"),
                }
                let next = state.finish(done.job, result, now);
                if let Some(run_id) = next {
                    state.start(done.job, run_id.clone(), now);
                    launch(&mut running, &runner, &cancel, done.job, run_id);
                }
                state.persist(done.job).await;
                let _ = finished.send(done);
            }

            msg = rx.recv() => {
                match msg {
                    Some(Control::Trigger { job, reply }) => {
                        let request = state.request(job, Utc::now());
                        if let Request::Start(run_id) = &request {
                            state.persist(job).await;
                            launch(&mut running, &runner, &cancel, job, run_id.clone());
                        } else {
                            tracing::info!(%job, pending = %request.run_id(), "trigger coalesced into pending run");
                        }
                        let _ = reply.send(request);
                    }
                    Some(Control::Jobs { reply }) => {
                        let _ = reply.send(state.jobs(Utc::now()));
                    }
                    Some(Control::Shutdown) | None => {
                        tracing::info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    while let Some(joined) = running.join_next().await {
        if let Ok(done) = joined {
            let result = done.outcome.as_ref().map(|_| ()).map_err(Clone::clone);
            let pending = state.finish(done.job, result, Utc::now());
            let job = done.job;
            let _ = finished.send(done);
            if let Some(run_id) = pending {
                drop_pending(&finished, job, run_id);
            }
        }
    }
    for job in JOBS {
        if let Some(run_id) = state.take_pending(job) {
            drop_pending(&finished, job, run_id);
        }
    }
    state.flush().await
}

/// Tell waiters that a queued run will never start.
fn drop_pending(finished: &broadcast::Sender<RunFinished>, job: Job, run_id: String) {
    tracing::warn!(%job, run_id = %run_id, "scheduler stopped; pending run dropped");
    let _ = finished.send(RunFinished {
        job,
        run_id,
        outcome: Err("scheduler shut down before the run started".to_string()),
    });
}
