//! # Knowledge Assistant
//!
//! An incremental semantic index over a directory of personal notes, with
//! retrieval-augmented answers and scheduled summaries.
//!
//! Each sync scans the corpus, compares content fingerprints against the
//! SQLite sync state, and only re-chunks, re-embeds and re-writes documents
//! that actually changed. Points for edited or deleted notes are removed
//! from the vector store; a re-run with nothing changed writes nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Scanner  │──▶│ Chunker │──▶│ Orchestrator │──▶│ Synchronizer │──▶ Qdrant
//! │ (corpus) │   │         │   │ (embeddings) │   │ (write-ahead)│
//! └──────────┘   └─────────┘   └──────────────┘   └──────┬───────┘
//!                                                         │ SQLite state
//!      ┌───────────┐   ┌───────────┐   ┌──────────┐       │
//!      │ Scheduler │──▶│ Retrieval │──▶│ Composer │──▶ Ollama
//!      └─────┬─────┘   └───────────┘   └──────────┘
//!            │
//!      ┌─────┴─────┐
//!      │ CLI / HTTP│
//!      └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pka init                        # create the state database
//! pka sync                        # index the corpus
//! pka ask "what did I decide about the budget?"
//! pka summarize                   # summary of the last 24 hours
//! pka serve                       # scheduler + HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, chunks and embedded chunks |
//! | [`scanner`] | Corpus walk and fingerprint diff against the sync state |
//! | [`extract`] | Text extraction (markdown front matter, PDF, DOCX) |
//! | [`chunk`] | Token-bounded, overlapping chunking |
//! | [`embedding`] | Embedding backends (Ollama, OpenAI, local) |
//! | [`orchestrator`] | Batched, bounded-concurrency embedding |
//! | [`vector_store`] | Vector store backends (Qdrant, in-memory) |
//! | [`sync`] | Write-ahead synchronization and the sync pipeline |
//! | [`retrieval`] | Ranking and token-budgeted context assembly |
//! | [`generation`] | Text generation backends |
//! | [`composer`] | Answer and summary prompts |
//! | [`scheduler`] | Periodic and manual job runs with coalescing |
//! | [`service`] | The assembled system behind the CLI and server |
//! | [`server`] | HTTP API |
//! | [`state`] | SQLite sync, schedule and run records |
//! | [`retry`] | Retry with backoff and timeouts for remote calls |
//! | [`error`] | Backend error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod composer;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod state;
pub mod sync;
pub mod vector_store;
