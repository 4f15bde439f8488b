//! # Personal Knowledge Assistant CLI (`pka`)
//!
//! ## Usage
//!
//! ```bash
//! pka --config ./config/pka.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pka init` | Create the state database and run schema migrations |
//! | `pka scan` | Show what a sync would do, without writing anything |
//! | `pka sync` | Bring the vector index up to date with the corpus |
//! | `pka ask "<question>"` | Answer a question from the notes |
//! | `pka summarize` | Summarize recently indexed notes and save the summary |
//! | `pka status` | Show index and job status |
//! | `pka serve` | Run the scheduler and the HTTP API |
//!
//! Logs go to stderr (`RUST_LOG` overrides `[logging].level`); command
//! output goes to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use knowledge_assistant::config::{self, Config};
use knowledge_assistant::scheduler::{JobOutput, SchedulerOptions};
use knowledge_assistant::server;
use knowledge_assistant::service::{
    load_status, open_state, KnowledgeBase, KnowledgeService, Status,
};
use knowledge_assistant::state::Job;
use knowledge_assistant::sync::SyncReport;

/// Personal knowledge assistant: an incremental semantic index over your
/// notes, with retrieval-augmented answers and daily summaries.
#[derive(Parser)]
#[command(name = "pka", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pka.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state database. Safe to run repeatedly.
    Init,

    /// Compare the corpus with the sync state and list pending changes.
    Scan,

    /// Run one sync: index new and changed documents, drop removed ones.
    Sync {
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question about your notes.
    Ask {
        question: String,

        /// Number of passages to retrieve (defaults to `[retrieval].top_k`).
        #[arg(long)]
        limit: Option<usize>,

        /// Only use notes under this path prefix.
        #[arg(long)]
        path_prefix: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Summarize notes indexed during the lookback window.
    Summarize,

    /// Show documents indexed, failures and last job times.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Run the scheduler and serve the HTTP API.
    Serve {
        /// Override `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            open_state(&cfg).await?;
            std::fs::create_dir_all(&cfg.summaries.dir)?;
            println!("Database initialized at {}.", cfg.db.path.display());
        }
        Commands::Scan => run_scan(&cfg).await?,
        Commands::Sync { json } => run_sync(&cfg, json).await?,
        Commands::Ask {
            question,
            limit,
            path_prefix,
            json,
        } => {
            let base = KnowledgeBase::open(&cfg).await?;
            let k = limit.unwrap_or(cfg.retrieval.top_k);
            let filter = knowledge_assistant::vector_store::QueryFilter {
                path_prefix,
                ..Default::default()
            };
            let response = base.ask_filtered(&question, k, &filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.answer);
                if !response.sources.is_empty() {
                    println!();
                    println!("Sources:");
                    for source in &response.sources {
                        println!("  {:.3}  {}  ({})", source.score, source.path, source.chunk_id);
                    }
                }
                if response.truncated {
                    println!("  (lower-ranked passages left out to fit the token budget)");
                }
            }
        }
        Commands::Summarize => {
            let service = manual_service(&cfg).await?;
            let done = service.scheduler().run_and_wait(Job::Summary).await;
            service.shutdown().await?;
            match done?.outcome {
                Ok(JobOutput::Summary(summary)) => {
                    println!("{}", summary.text);
                    if let Some(path) = summary.path {
                        println!();
                        println!("Saved to {}", path.display());
                    }
                }
                Ok(JobOutput::Sync(_)) => bail!("unexpected sync output for a summary run"),
                Err(message) => bail!("summary failed: {}", message),
            }
        }
        Commands::Status { json } => {
            let base = KnowledgeBase::open(&cfg).await?;
            let mut status = load_status(base.state(), Vec::new()).await?;
            match base.point_count().await {
                Ok(points) => status.points = Some(points),
                Err(err) => tracing::warn!(error = %format!("{:#}", err), "failed to count points"),
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Serve { bind } => {
            let service =
                KnowledgeService::start(&cfg, SchedulerOptions::from_config(&cfg.scheduler))
                    .await?;
            let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
            server::run_server(Arc::new(service), &bind).await?;
        }
    }

    Ok(())
}

/// Scheduler without the timer: runs start only when triggered.
async fn manual_service(cfg: &Config) -> Result<KnowledgeService> {
    let options = SchedulerOptions {
        timer: false,
        ..SchedulerOptions::from_config(&cfg.scheduler)
    };
    KnowledgeService::start(cfg, options).await
}

async fn run_scan(cfg: &Config) -> Result<()> {
    let base = KnowledgeBase::open(cfg).await?;
    let report = base.pipeline().scan().await?;

    println!("scan {}", cfg.corpus.root.display());
    println!("  new: {}", report.new.len());
    println!("  changed: {}", report.changed.len());
    println!("  unchanged: {}", report.unchanged.len());
    println!("  removed: {}", report.removed.len());
    println!("  skipped: {}", report.skipped.len());
    for doc in report.new.iter() {
        println!("  + {}", doc.path);
    }
    for doc in report.changed.iter() {
        println!("  ~ {}", doc.path);
    }
    for path in &report.removed {
        println!("  - {}", path);
    }
    for warning in &report.warnings {
        println!("  ! {}: {}", warning.path, warning.message);
    }
    Ok(())
}

async fn run_sync(cfg: &Config, json: bool) -> Result<()> {
    let service = manual_service(cfg).await?;
    let done = tokio::select! {
        done = service.scheduler().run_and_wait(Job::Sync) => done,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted; finishing documents already being written...");
            service.shutdown().await?;
            bail!("sync interrupted");
        }
    };
    service.shutdown().await?;

    match done?.outcome {
        Ok(JobOutput::Sync(report)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_sync_report(cfg, &report);
            }
            Ok(())
        }
        Ok(JobOutput::Summary(_)) => bail!("unexpected summary output for a sync run"),
        Err(message) => bail!("sync failed: {}", message),
    }
}

fn print_sync_report(cfg: &Config, report: &SyncReport) {
    println!("sync {}", cfg.corpus.root.display());
    println!("  run: {}", report.run_id);
    println!("  indexed: {}", report.documents_indexed);
    println!("  unchanged: {}", report.documents_unchanged);
    println!("  removed: {}", report.documents_removed);
    println!("  skipped: {}", report.documents_skipped);
    println!("  chunks upserted: {}", report.chunks_upserted);
    println!("  chunks deleted: {}", report.chunks_deleted);
    for failure in &report.documents_failed {
        println!("  failed: {}: {}", failure.path, failure.reason);
    }
    for chunk in &report.chunks_failed {
        println!(
            "  failed chunk: {}#{}: {}",
            chunk.path, chunk.ordinal, chunk.reason
        );
    }
    for warning in &report.warnings {
        println!("  warning: {}: {}", warning.path, warning.message);
    }
    println!("{}", report.status);
}

fn print_status(status: &Status) {
    let time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    };
    println!("collection: {}", status.collection);
    println!("documents indexed: {}", status.documents_indexed);
    println!("documents failed: {}", status.documents_failed);
    if let Some(points) = status.points {
        println!("points: {}", points);
    }
    if let Some(model) = &status.embedding_model {
        println!("embedding model: {}", model);
    }
    println!("last sync: {}", time(status.last_sync_time));
    println!("last summary: {}", time(status.last_summary_time));
    if let Some(run) = &status.last_run {
        println!("last run: {} ({})", run.id, run.status);
        if let Some(error) = &run.error {
            println!("  error: {}", error);
        }
    }
}
