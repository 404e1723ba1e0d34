mod config;
mod export;
mod furniture;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod supabase;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use eyre::WrapErr;
use export::{ArchiveHandle, ExportError};
use furniture::grouping::{GroupingOutcome, SCORE_EPSILON};
use furniture::listing::Listing;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BatchRequest, BatchResponse, ExportRequest, ExtractRequest, ExtractResponse,
    GroupRequest, ListingStageRequest, ListingStageResponse, ScoreRequest, ScoreResponse,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "furnish.api", "server crashed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env().wrap_err("reading configuration")?;
    let port = config.port;
    let pipeline = Pipeline::from_config(config).wrap_err("validating configuration")?;
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState::new(pipeline, prometheus_handle);
    let app = app(state);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "furnish.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, BatchResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

impl AppState {
    fn new(pipeline: Pipeline, prometheus_handle: PrometheusHandle) -> Self {
        let config = pipeline.config();
        let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone(), config.queue_capacity);
        let openapi: serde_json::Value =
            serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
                .unwrap_or(json!({"openapi": "3.0.3"}));
        let redis = config
            .redis_url
            .as_deref()
            .and_then(|url| match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(target = "furnish.api", error = %err, "redis_unavailable_using_memory");
                    None
                }
            });
        Self {
            pipeline,
            queue,
            openapi: Arc::new(openapi),
            idempotency: Arc::new(Mutex::new(HashMap::new())),
            prometheus_handle,
            redis,
        }
    }
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);
    let body_limit = state.pipeline.config().request_max_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/batches", post(create_batch))
        .route("/exports", post(create_export))
        .nest(
            "/stages",
            Router::new()
                .route("/extract", post(stage_extract))
                .route("/group", post(stage_group))
                .route("/score", post(stage_score))
                .route("/listing", post(stage_listing)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/batches", post(enqueue_batch_job))
                .route("/{id}", get(get_job_status).delete(cancel_job)),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Reports whether a model gateway is wired; without one every batch runs
/// on fallback attributes and templated listings.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.pipeline.config();
    Json(json!({
        "status": "ok",
        "service": "furnish-api-rs",
        "llm": config.llm.is_some(),
        "holistic": state.pipeline.grouping().has_holistic(),
        "strategies": config
            .grouping
            .strategies
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>(),
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = state.pipeline.config().openapi_key.as_deref() {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Furnish API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = state.pipeline.config().metrics_key.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Run the photos → grouped listings pipeline.
///
/// - Method: `POST`
/// - Path: `/batches`
/// - Headers: optional `Idempotency-Key`
/// - Body: `BatchRequest`
/// - Response: `BatchResponse` (groups, listings, per-stage transcript)
async fn create_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    crate::metrics::inc_requests("/batches");

    let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return Ok(Json(state.pipeline.run(payload).await?));
    };

    if let Some(client) = &state.redis {
        if let Some(existing) = idempotency::redis_get(client, &key).await {
            info!(target = "furnish.api", key = %key, "idempotent_replay");
            return Ok(Json(existing));
        }
        let response = state.pipeline.run(payload).await?;
        let ttl = state.pipeline.config().idempotency_ttl_secs;
        idempotency::redis_set(client, &key, &response, ttl).await;
        return Ok(Json(response));
    }

    if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
        info!(target = "furnish.api", key = %key, "idempotent_replay");
        return Ok(Json(existing));
    }
    let response = state.pipeline.run(payload).await?;
    state.idempotency.lock().await.insert(key, response.clone());
    Ok(Json(response))
}

/// Package already assembled listings into an export directory.
async fn create_export(
    State(state): State<AppState>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<ArchiveHandle>, AppError> {
    crate::metrics::inc_requests("/exports");
    let handle = state
        .pipeline
        .exporter()
        .export(&req.listings)
        .await
        .map_err(|err| match err {
            ExportError::Empty => PipelineError::invalid_input("export", err.to_string()),
            other => PipelineError::internal("export", other.to_string()),
        })?;
    Ok(Json(handle))
}

// -------- Stage endpoints (manual granular control) --------

async fn stage_extract(
    State(state): State<AppState>,
    Json(req): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    crate::metrics::inc_requests("/stages/extract");
    let images = pipeline::stages::resolve_images(
        &req.images_source,
        state.pipeline.config().max_images,
    )?;
    let batch = state.pipeline.extract(&images.value).await;
    Ok(Json(ExtractResponse {
        records: batch.records,
        errors: batch.errors,
    }))
}

async fn stage_group(
    State(state): State<AppState>,
    Json(req): Json<GroupRequest>,
) -> Result<Json<GroupingOutcome>, AppError> {
    crate::metrics::inc_requests("/stages/group");
    let max = state.pipeline.config().max_images;
    if req.records.len() > max {
        return Err(PipelineError::invalid_input(
            "group_records",
            format!("too_many_records: {} > {max}", req.records.len()),
        )
        .into());
    }
    Ok(Json(state.pipeline.grouping().group(&req.records).await))
}

async fn stage_score(
    State(state): State<AppState>,
    Json(req): Json<ScoreRequest>,
) -> Json<ScoreResponse> {
    crate::metrics::inc_requests("/stages/score");
    let scores = state.pipeline.scorer().breakdown(&req.a, &req.b);
    let threshold = state.pipeline.grouping().config().threshold;
    Json(ScoreResponse {
        would_group: scores.total + SCORE_EPSILON >= threshold,
        scores,
        threshold,
    })
}

async fn stage_listing(
    State(state): State<AppState>,
    Json(req): Json<ListingStageRequest>,
) -> Result<Json<ListingStageResponse>, AppError> {
    crate::metrics::inc_requests("/stages/listing");
    if req.group.members.is_empty() {
        return Err(PipelineError::invalid_input("assemble_listings", "group has no members").into());
    }
    let response = match state.pipeline.assembler().assemble(&req.group).await {
        Ok(listing) => ListingStageResponse {
            listing,
            error: None,
        },
        Err(err) => ListingStageResponse {
            listing: Listing::placeholder(&req.group, state.pipeline.synonyms()),
            error: Some(err.to_string()),
        },
    };
    Ok(Json(response))
}

// -------- Background jobs --------

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_batch_job(
    State(state): State<AppState>,
    Json(payload): Json<BatchRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/batches");
    let id = state
        .queue
        .enqueue_batch(payload)
        .await
        .map_err(|err| PipelineError::internal("enqueue", err.error))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

fn parse_job_id(id: &str) -> Result<uuid::Uuid, AppError> {
    uuid::Uuid::parse_str(id)
        .map_err(|_| PipelineError::invalid_input("jobs", "invalid_job_id").into())
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let uuid = parse_job_id(&id)?;
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    let uuid = parse_job_id(&id)?;
    state
        .queue
        .cancel(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    NotFound(&'static str),
    Unauthorized,
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    ApiError {
                        error: err.stage().to_string(),
                        detail: Some(err.detail().to_string()),
                    },
                )
            }
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: "not_found".into(),
                    detail: Some(format!("{what} not found")),
                },
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: "unauthorized".into(),
                    detail: None,
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
