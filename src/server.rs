use crate::constants::{DEFAULT_BATCH_LIST_LIMIT, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use crate::error::ImporterError;
use crate::metrics;
use crate::pipeline::ImportPipeline;
use crate::storage::Storage;
use crate::types::{Event, LoadBatch};
use axum::{
    extract::{Path, Query},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use hyper::Server;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub pipeline: Arc<ImportPipeline>,
    /// Cancelled on shutdown; in-flight imports get a child token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct EventListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct BatchListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventPage {
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
    pub results: Vec<Event>,
}

struct ApiError(ImporterError);

impl From<ImporterError> for ApiError {
    fn from(err: ImporterError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

fn clamp_limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "sympla-importer",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn list_events(
    Extension(state): Extension<AppState>,
    Query(params): Query<EventListParams>,
) -> Result<Json<EventPage>, ApiError> {
    let limit = clamp_limit(params.limit, DEFAULT_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let count = state.storage.count_events().await?;
    let results = state.storage.list_events(limit, offset).await?;
    Ok(Json(EventPage {
        count,
        limit,
        offset,
        results,
    }))
}

async fn list_batches(
    Extension(state): Extension<AppState>,
    Query(params): Query<BatchListParams>,
) -> Result<Json<Vec<LoadBatch>>, ApiError> {
    let limit = clamp_limit(params.limit, DEFAULT_BATCH_LIST_LIMIT);
    Ok(Json(state.storage.list_batches(limit).await?))
}

async fn get_batch(
    Extension(state): Extension<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    Ok(match state.storage.get_batch(batch_id).await? {
        Some(batch) => Json(batch).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("batch {batch_id} not found") })),
        )
            .into_response(),
    })
}

async fn metrics_text() -> Response {
    match metrics::render() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

async fn run_import(Extension(state): Extension<AppState>) -> Result<Response, ApiError> {
    let cancel = state.shutdown.child_token();
    let summary = state.pipeline.run(&cancel).await?;
    Ok(Json(summary).into_response())
}

/// Build the router with all routes
pub fn create_server(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/events", get(list_events))
        .route("/api/events/", get(list_events))
        .route("/api/batches", get(list_batches))
        .route("/api/batches/", get(list_batches))
        .route("/api/batches/:id", get(get_batch))
        .route("/admin/import", post(run_import))
        .layer(Extension(state))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Serve until the shutdown token fires
pub async fn start_server(state: AppState, port: u16) -> crate::error::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_server(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("HTTP server listening on {}", addr);
    println!("🚀 HTTP server running on http://localhost:{port}");
    println!("💚 Health check: http://localhost:{port}/health");
    println!("📋 Events:       http://localhost:{port}/api/events/");

    Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ImporterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    info!("HTTP server stopped");
    Ok(())
}
