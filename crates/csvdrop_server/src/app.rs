use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{self, HeaderName, HeaderValue},
        HeaderMap, Method, StatusCode,
    },
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use csvdrop_transfer::{
    ErrorKind, ProgressEvent, ProgressObserver, TracingObserver, UploadError, UploadPipeline,
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

const INDEX_PAGE: &str = include_str!("static/index.html");
const UPLOAD_SUCCESS: &str = "Uploaded successfully";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub http_bind: String,
    pub allowed_origin: String,
    pub upload_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseUpdate {
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: String,
    pub file_name: String,
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<UploadPipeline>,
    pub server_config: Arc<ServerConfig>,
    pub sse_bus: broadcast::Sender<SseUpdate>,
}

impl AppState {
    pub fn new(server_config: ServerConfig) -> Self {
        let (sse_bus, _) = broadcast::channel(256);
        Self {
            pipeline: Arc::new(UploadPipeline::new(&server_config.upload_dir)),
            server_config: Arc::new(server_config),
            sse_bus,
        }
    }
}

pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let cors = cors_layer(&state.server_config.allowed_origin)?;

    Ok(Router::new()
        .route("/", get(index))
        .route("/up", get(upload_form))
        .route("/upload", post(upload_file))
        .route("/health/live", get(health_live))
        .route("/v1/uploads/events", get(stream_upload_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(allowed_origin: &str) -> anyhow::Result<CorsLayer> {
    let origin: HeaderValue = allowed_origin
        .parse()
        .with_context(|| format!("invalid CORS origin {allowed_origin}"))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::POST,
            Method::GET,
            Method::OPTIONS,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            HeaderName::from_static("x-csrf-token"),
            header::AUTHORIZATION,
        ]))
}

async fn index() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::SERVER, "csvdrop")],
        "Hello world",
    )
}

async fn upload_form() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        INDEX_PAGE,
    )
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let started = Instant::now();
    let upload_id = Uuid::now_v7().to_string();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    emit(&state, "upload.started", json!({ "upload_id": upload_id.clone() }));

    let bus = state.sse_bus.clone();
    let progress_id = upload_id.clone();
    let mut log = TracingObserver::new(upload_id.clone());
    let mut observer = move |event: ProgressEvent| {
        log.notify(event.clone());
        let _ = bus.send(SseUpdate {
            event_type: "upload.progress".to_string(),
            data: json!({ "upload_id": progress_id.clone(), "progress": event }),
        });
    };

    let result = state
        .pipeline
        .handle_upload(content_type.as_deref(), body.into_data_stream(), &mut observer)
        .await;

    info!(
        upload_id = %upload_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        succeeded = result.is_ok(),
        "upload request finished"
    );

    match result {
        Ok(stored) => {
            emit(
                &state,
                "upload.completed",
                json!({
                    "upload_id": upload_id,
                    "file_name": stored.file_name.clone(),
                    "size": stored.size
                }),
            );
            Ok((
                StatusCode::OK,
                Json(UploadResponse {
                    success: UPLOAD_SUCCESS.to_string(),
                    file_name: stored.file_name,
                }),
            ))
        }
        Err(err) => {
            emit(
                &state,
                "upload.failed",
                json!({
                    "upload_id": upload_id,
                    "error": err.kind(),
                    "detail": err.to_string()
                }),
            );
            Err(upload_error(err))
        }
    }
}

async fn stream_upload_events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.sse_bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(update) => {
                let data = serde_json::to_string(&update.data).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(update.event_type).data(data)))
            }
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::MalformedOrOversizedForm | ErrorKind::MissingFileField => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::UnsupportedFileType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::StreamNotSeekable | ErrorKind::StorageUnavailable => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn upload_error(err: UploadError) -> (StatusCode, Json<Value>) {
    let status = status_for(err.kind());
    if status.is_server_error() {
        error!(error = %err, "upload request failed");
    }
    (
        status,
        Json(json!({ "error": err.kind(), "detail": err.to_string() })),
    )
}

fn emit(state: &AppState, event_type: &str, data: Value) {
    let _ = state.sse_bus.send(SseUpdate {
        event_type: event_type.to_string(),
        data,
    });
}
