//! HTTP front door for the knowledge base.
//!
//! # Endpoints
//!
//! | Method   | Path                  | Description |
//! |----------|-----------------------|-------------|
//! | `GET`    | `/health`             | Health check (version, indexed chunks) |
//! | `GET`    | `/api/files`          | List files in the watched directory |
//! | `GET`    | `/api/files/{name}`   | Download one file |
//! | `POST`   | `/api/upload`         | Store a file (`{filename, content_base64}`) and ingest it |
//! | `POST`   | `/api/query`          | Buffered answer (`{question, session_id?}`) |
//! | `POST`   | `/api/stream`         | Streamed answer as server-sent events |
//! | `GET`    | `/api/history/{id}`   | Conversation history of a session |
//! | `DELETE` | `/api/history/{id}`   | Clear a session |
//!
//! # Streaming
//!
//! Every SSE `data:` line carries one JSON event:
//! `{"type":"sources",...}`, then `{"type":"token","token":"..."}` repeated,
//! then `{"type":"end"}`. If generation fails mid-stream the last event is
//! `{"type":"error","error":{"code","message"}}` and no `end` is sent.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::KbError;
use crate::models::{FileEntry, Message};
use crate::service::{KnowledgeBase, SyncReport};

const DEFAULT_SESSION: &str = "default";
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    kb: Arc<KnowledgeBase>,
}

/// Starts the HTTP server on `[server].bind` and serves until terminated.
pub async fn run_server(kb: Arc<KnowledgeBase>) -> anyhow::Result<()> {
    let bind_addr = kb.config().server.bind.clone();
    let app = router(kb);

    info!(addr = %bind_addr, "knowledge base server listening");
    println!("Knowledge base server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router. Exposed for in-process testing.
pub fn router(kb: Arc<KnowledgeBase>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/files", get(handle_list_files))
        .route("/api/files/{*name}", get(handle_download))
        .route("/api/upload", post(handle_upload))
        .route("/api/query", post(handle_query))
        .route("/api/stream", post(handle_stream))
        .route(
            "/api/history/{session_id}",
            get(handle_get_history).delete(handle_clear_history),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(AppState { kb })
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
    code: String,
    message: String,
}

impl AppError {
    fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code.clone(),
                message: self.message.clone(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = self.body();
        (self.status, Json(body)).into_response()
    }
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let status = match &err {
            KbError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            KbError::EmptyIndex(_) => StatusCode::CONFLICT,
            KbError::Retrieval(_) | KbError::Generation(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
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
    indexed_chunks: i64,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        indexed_chunks: state.kb.indexed_chunks().await?,
    }))
}

// ============ Files ============

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<FileEntry>,
}

async fn handle_list_files(State(state): State<AppState>) -> Result<Json<FilesResponse>, AppError> {
    Ok(Json(FilesResponse {
        files: state.kb.list_files()?,
    }))
}

async fn handle_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let path = state
        .kb
        .resolve_file(&name)
        .map_err(|e| not_found(e.to_string()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| AppError::from(KbError::Io(e)))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', "_"))
        .unwrap_or_default();

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize)]
struct UploadRequest {
    filename: String,
    content_base64: String,
}

#[derive(Serialize)]
struct UploadResponse {
    filename: String,
    report: SyncReport,
}

async fn handle_upload(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.content_base64.trim())
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;
    let (filename, report) = state.kb.upload_file(&req.filename, &bytes).await?;
    Ok(Json(UploadResponse { filename, report }))
}

// ============ Questions ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    session_id: Option<String>,
}

impl QueryRequest {
    fn session(&self) -> &str {
        self.session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SESSION)
    }
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let answer = state.kb.query(&req.question, req.session()).await?;
    Ok(Json(answer).into_response())
}

async fn handle_stream(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let events = state.kb.stream_query(&req.question, req.session()).await?;

    let sse_events = events.map(|item| match item {
        Ok(event) => Event::default().json_data(&event),
        Err(err) => {
            let err = AppError::from(err);
            let mut payload = serde_json::to_value(err.body()).unwrap_or_default();
            payload["type"] = serde_json::Value::from("error");
            Event::default().json_data(payload)
        }
    });

    Ok(Sse::new(sse_events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

// ============ History ============

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    history: Vec<Message>,
}

async fn handle_get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    let history = state.kb.history(&session_id).await;
    Json(HistoryResponse {
        session_id,
        history,
    })
}

async fn handle_clear_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<serde_json::Value> {
    state.kb.clear_history(&session_id).await;
    Json(serde_json::json!({ "status": "ok", "session_id": session_id }))
}
