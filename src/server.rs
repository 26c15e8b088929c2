//! HTTP server.
//!
//! Serves the latest lead feeds from the result store, triggers refreshes, and
//! streams the progress log.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/sources` | Configured sources with refresh state and counts |
//! | `GET`/`POST` | `/refresh` | Refresh every enabled source (`?days=&limit=`) |
//! | `GET`/`POST` | `/refresh/{source}` | Refresh one source |
//! | `GET`  | `/data/{source}/{bucket}.{csv,json}` | A bucket of leads |
//! | `GET`  | `/logs` | Progress log as Server-Sent Events, history first |
//! | `GET`  | `/logs/history` | Progress log history as plain text |
//!
//! Any other path is served from `[server].static_dir` when configured.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "unknown source: 'nope'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404).
//!
//! Before the first refresh of a source completes, `/data` answers
//! `202 Accepted` with the body `App still loading...`.

use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use permit_leads_core::models::Bucket;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::config::Config;
use crate::export::{file_name, to_json, ExportFormat};
use crate::orchestrator::Orchestrator;
use crate::pipeline::RefreshOptions;
use crate::progress::ProgressLog;
use crate::store::{DataView, SlotState, StoreError};

/// Body served for data requests before the first result exists.
pub const STILL_LOADING: &str = "App still loading...";

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the router; `static_dir` is served as the fallback when given.
pub fn build_router(state: AppState, static_dir: Option<&FsPath>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/health", get(handle_health))
        .route("/sources", get(handle_sources))
        .route("/refresh", get(handle_refresh_all).post(handle_refresh_all))
        .route(
            "/refresh/{source}",
            get(handle_refresh_one).post(handle_refresh_one),
        )
        .route("/data/{source}/{file}", get(handle_data))
        .route("/logs", get(handle_logs))
        .route("/logs/history", get(handle_log_history));

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router.layer(cors).with_state(state)
}

/// Starts the HTTP server.
///
/// Builds the orchestrator from `config`, kicks off the startup refresh and
/// the refresh schedule when configured, and serves until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let log = Arc::new(ProgressLog::new(
        config.logging.history_limit,
        config.logging.channel_capacity,
    ));
    let orchestrator = Arc::new(Orchestrator::from_config(config, log)?);

    if config.refresh.on_startup {
        let names = orchestrator.refresh_all(RefreshOptions::default());
        tracing::info!("startup refresh of {} sources", names.len());
    }
    if config.refresh.interval_minutes > 0 {
        orchestrator.spawn_schedule(Duration::from_secs(config.refresh.interval_minutes * 60));
        tracing::info!(
            "refreshing every {} minutes",
            config.refresh.interval_minutes
        );
    }

    let app = build_router(
        AppState { orchestrator },
        config.server.static_dir.as_deref(),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("leads server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
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

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        not_found(err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /sources ============

#[derive(Serialize)]
struct SourceInfo {
    name: String,
    label: String,
    enabled: bool,
    endpoint: String,
    join_key: String,
    state: SlotState,
    refreshed_at: Option<String>,
    counts: std::collections::BTreeMap<String, usize>,
    last_error: Option<String>,
}

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceInfo>,
}

async fn handle_sources(State(state): State<AppState>) -> Result<Json<SourcesResponse>, AppError> {
    let orch = &state.orchestrator;
    let mut sources = Vec::with_capacity(orch.sources().len());
    for source in orch.sources() {
        let descriptor = source.descriptor();
        let status = orch.status(source.name())?;
        sources.push(SourceInfo {
            name: source.name().to_string(),
            label: descriptor.label(),
            enabled: source.enabled,
            endpoint: descriptor.endpoint.clone(),
            join_key: descriptor.join_key.describe(),
            state: status.state,
            refreshed_at: status.refreshed_at.map(|t| t.to_rfc3339()),
            counts: status.counts,
            last_error: status.last_error,
        });
    }
    Ok(Json(SourcesResponse { sources }))
}

// ============ /refresh ============

#[derive(Serialize)]
struct RefreshResponse {
    refreshing: Vec<String>,
}

async fn handle_refresh_all(
    State(state): State<AppState>,
    Query(options): Query<RefreshOptions>,
) -> (StatusCode, Json<RefreshResponse>) {
    let refreshing = state.orchestrator.refresh_all(options);
    (StatusCode::ACCEPTED, Json(RefreshResponse { refreshing }))
}

async fn handle_refresh_one(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(options): Query<RefreshOptions>,
) -> Result<(StatusCode, Json<RefreshResponse>), AppError> {
    state.orchestrator.refresh(&source, options)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshResponse {
            refreshing: vec![source],
        }),
    ))
}

// ============ GET /data/{source}/{bucket}.{ext} ============

async fn handle_data(
    State(state): State<AppState>,
    Path((source, file)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (bucket_part, ext) = file
        .rsplit_once('.')
        .ok_or_else(|| bad_request(format!("expected <bucket>.csv or <bucket>.json, got '{}'", file)))?;
    let format = ExportFormat::from_extension(ext)
        .ok_or_else(|| bad_request(format!("unsupported format: '{}'", ext)))?;
    let bucket: Bucket = bucket_part.parse().map_err(not_found)?;

    let result = match state.orchestrator.get_data(&source, bucket)? {
        DataView::StillLoading => {
            return Ok((StatusCode::ACCEPTED, STILL_LOADING).into_response());
        }
        DataView::Ready(result) => result,
    };

    match format {
        ExportFormat::Csv => {
            let body = result.csv(bucket).unwrap_or_default().to_string();
            let disposition = format!(
                "attachment; filename=\"{}\"",
                file_name(&source, bucket, ExportFormat::Csv)
            );
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                body,
            )
                .into_response())
        }
        ExportFormat::Json => {
            let records = result.records(bucket).unwrap_or_default();
            let body = to_json(records).map_err(|e| bad_request(e.to_string()))?;
            Ok((
                [(header::CONTENT_TYPE, "application/json".to_string())],
                body,
            )
                .into_response())
        }
    }
}

// ============ /logs ============

async fn handle_logs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (history, mut rx) = state.orchestrator.log().subscribe();
    tracing::debug!("log viewer connected, replaying {} lines", history.len());

    let stream = async_stream::stream! {
        for line in history {
            yield Ok(Event::default().event("log").data(line.to_string()));
        }
        loop {
            match rx.recv().await {
                Ok(line) => yield Ok(Event::default().event("log").data(line.to_string())),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("log viewer lagged, skipped {} lines", missed);
                    yield Ok(Event::default().comment(format!("skipped {} lines", missed)));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn handle_log_history(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.orchestrator.log().history_text(),
    )
}
