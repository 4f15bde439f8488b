//! HTTP server.
//!
//! Exposes the knowledge service as a small JSON API. The scheduler runs in
//! the same process and keeps the index fresh while the server is up.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check |
//! | `GET`  | `/api/v1/ask?q=&limit=` | Answer a question from the notes |
//! | `POST` | `/api/v1/summarize` | Generate a summary of recent notes now |
//! | `POST` | `/api/v1/ingest` | Trigger a sync; returns the run id |
//! | `GET`  | `/api/v1/status` | Index and scheduler status |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "q must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `timeout` (504), `backend_error` (502),
//! `internal` (500).

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::composer::SummaryReport;
use crate::error::BackendError;
use crate::scheduler::JobOutput;
use crate::service::{AskResponse, KnowledgeService, Status};
use crate::state::Job;

#[derive(Clone)]
struct AppState {
    service: Arc<KnowledgeService>,
}

pub fn router(service: Arc<KnowledgeService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/ask", get(handle_ask))
        .route("/api/v1/summarize", post(handle_summarize))
        .route("/api/v1/ingest", post(handle_ingest))
        .route("/api/v1/status", get(handle_status))
        .layer(cors)
        .with_state(AppState { service })
}

/// Serve until Ctrl-C, then stop the scheduler cleanly.
pub async fn run_server(service: Arc<KnowledgeService>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(Arc::clone(&service));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    println!("Knowledge assistant listening on http://{}", bind_addr);
    tracing::info!(bind = bind_addr, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    service.shutdown().await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

/// Map a service error onto a status code, looking through the context
/// chain for a backend failure.
fn classify(err: anyhow::Error) -> AppError {
    let message = format!("{:#}", err);
    match err.chain().find_map(|e| e.downcast_ref::<BackendError>()) {
        Some(BackendError::Timeout { .. }) => AppError {
            status: StatusCode::GATEWAY_TIMEOUT,
            code: "timeout",
            message,
        },
        Some(_) => AppError {
            status: StatusCode::BAD_GATEWAY,
            code: "backend_error",
            message,
        },
        None => AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message,
        },
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
struct AskParams {
    q: Option<String>,
    limit: Option<usize>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Query(params): Query<AskParams>,
) -> Result<Json<AskResponse>, AppError> {
    let question = params.q.unwrap_or_default();
    if question.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let limit = params
        .limit
        .unwrap_or(state.service.base().retrieval().config().top_k);
    if limit == 0 {
        return Err(bad_request("limit must be at least 1"));
    }
    let response = state.service.ask(&question, limit).await.map_err(classify)?;
    Ok(Json(response))
}

#[derive(Serialize)]
struct SummarizeResponse {
    status: &'static str,
    run_id: String,
    #[serde(flatten)]
    summary: SummaryReport,
}

async fn handle_summarize(
    State(state): State<AppState>,
) -> Result<Json<SummarizeResponse>, AppError> {
    let done = state
        .service
        .scheduler()
        .run_and_wait(Job::Summary)
        .await
        .map_err(classify)?;
    match done.outcome {
        Ok(JobOutput::Summary(summary)) => Ok(Json(SummarizeResponse {
            status: "success",
            run_id: done.run_id,
            summary,
        })),
        Ok(JobOutput::Sync(_)) => Err(classify(anyhow::anyhow!(
            "run {} finished as a sync",
            done.run_id
        ))),
        Err(message) => Err(AppError {
            status: StatusCode::BAD_GATEWAY,
            code: "backend_error",
            message,
        }),
    }
}

#[derive(Serialize)]
struct IngestResponse {
    status: &'static str,
    run_id: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let run_id = state.service.trigger_sync().await.map_err(classify)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            status: "ingestion started",
            run_id,
        }),
    ))
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<Status>, AppError> {
    let status = state.service.status().await.map_err(classify)?;
    Ok(Json(status))
}
