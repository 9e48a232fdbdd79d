//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service banner |
//! | `GET`  | `/api/v1/health` | Component status, `healthy` or `degraded` |
//! | `POST` | `/api/v1/index` | Incremental index (`roots`, `force_reembed`, `model`) |
//! | `POST` | `/api/v1/index-full` | Full reset and reindex of `roots` |
//! | `POST` | `/api/v1/upload-files` | Save multipart `files` and index them |
//! | `POST` | `/api/v1/file/search` | Local retrieval with answer |
//! | `GET`/`POST` | `/api/v1/web/search` | Web search, query parameters |
//! | `POST` | `/api/v1/ask-with-file` | Hybrid question about one uploaded file |
//! | `POST` | `/api/v1/search/unified` | Local and web merged by strategy |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `busy` (409),
//! `web_search_failed` (502), `web_search_timeout` (504), `index_failed` and
//! `internal` (500). A `FAILED` indexing run is answered
//! with 500 and the full run result as the body.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser UI can be
//! served from anywhere.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, DefaultBodyLimit, Multipart, Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::error::{IndexError, QueryError};
use crate::ingest::IndexRequest;
use crate::models::{IndexRunResult, RunStatus};
use crate::query::{
    sanitize_file_name, AskWithFileRequest, LocalSearchRequest, UnifiedSearchRequest,
    WebSearchRequest, WebSearchResponse,
};
use crate::stats::{check_health, Health};

/// Build the router with all routes and layers.
pub fn router(app: App) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = app.config.server.max_upload_bytes;

    Router::new()
        .route("/", get(handle_root))
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/index", post(handle_index))
        .route("/api/v1/index-full", post(handle_index_full))
        .route("/api/v1/upload-files", post(handle_upload_files))
        .route("/api/v1/file/search", post(handle_file_search))
        .route(
            "/api/v1/web/search",
            get(handle_web_search).post(handle_web_search),
        )
        .route("/api/v1/ask-with-file", post(handle_ask_with_file))
        .route("/api/v1/search/unified", post(handle_unified_search))
        .fallback(handle_not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app)
}

/// Serve until the process is stopped.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    match app.engine.sweep_uploads().await {
        Ok(0) => {}
        Ok(sessions) => tracing::info!(sessions, "removed abandoned hybrid uploads"),
        Err(e) => tracing::warn!(error = %e, "failed to sweep abandoned hybrid uploads"),
    }

    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    println!("local-rag listening on http://{}", bind_addr);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error that renders as `{"error": {...}}`, optionally with extra
/// top-level fields.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": ErrorDetail {
                code: self.code,
                message: self.message,
            }
        });
        if let (Some(serde_json::Value::Object(extra)), Some(obj)) =
            (self.details, body.as_object_mut())
        {
            obj.extend(extra);
        }
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
        details: None,
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Busy(_) => app_error(StatusCode::CONFLICT, "busy", err.to_string()),
            IndexError::Validation(msg) => bad_request(msg),
            IndexError::Storage(msg) => {
                app_error(StatusCode::INTERNAL_SERVER_ERROR, "index_failed", msg)
            }
        }
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Validation(e) => bad_request(e.0),
            QueryError::Internal(e) => {
                tracing::error!(error = ?e, "request failed");
                internal(format!("{:#}", e))
            }
        }
    }
}

/// Parse an optional JSON body; an empty body yields `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))
}

// ============ GET / and /api/v1/health ============

async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "local-rag: local document retrieval with web search",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/api/v1/health",
    }))
}

async fn handle_health(State(app): State<App>) -> Json<Health> {
    Json(check_health(&app).await)
}

async fn handle_not_found(uri: Uri) -> AppError {
    app_error(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route for {}", uri.path()),
    )
}

// ============ Indexing ============

#[derive(Debug, Default, Deserialize)]
struct IndexBody {
    #[serde(default)]
    roots: Option<Vec<String>>,
    #[serde(default)]
    force_reembed: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

fn run_response(result: IndexRunResult) -> Response {
    let status = match result.status {
        RunStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, Json(result)).into_response()
}

async fn start_run(
    app: &App,
    body: IndexBody,
    mut request: IndexRequest,
) -> Result<Response, AppError> {
    request.roots = body
        .roots
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .map(PathBuf::from)
        .collect();
    request.embedder = app
        .embedder_for(body.model.as_deref())
        .map_err(|e| bad_request(format!("model: {:#}", e)))?;
    request.user_id = body.user_id;
    let result = app.indexer.run(request).await?;
    Ok(run_response(result))
}

async fn handle_index(State(app): State<App>, body: Bytes) -> Result<Response, AppError> {
    let body: IndexBody = parse_body(&body)?;
    let mut request = IndexRequest::incremental(Vec::new());
    request.force_reembed = body.force_reembed;
    start_run(&app, body, request).await
}

async fn handle_index_full(State(app): State<App>, body: Bytes) -> Result<Response, AppError> {
    let body: IndexBody = parse_body(&body)?;
    start_run(&app, body, IndexRequest::full(Vec::new())).await
}

#[derive(Serialize)]
struct UploadError {
    file: String,
    error: String,
}

#[derive(Serialize)]
struct UploadResponse {
    message: String,
    files: Vec<String>,
    result: IndexRunResult,
    upload_errors: Vec<UploadError>,
}

async fn handle_upload_files(
    State(app): State<App>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let upload_dir = app.config.storage.upload_dir();
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .map_err(|e| internal(format!("failed to create upload directory: {}", e)))?;

    let mut saved: Vec<PathBuf> = Vec::new();
    let mut upload_errors = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let original = field.file_name().unwrap_or_default().to_string();
        let name = match sanitize_file_name(&original) {
            Ok(name) => name,
            Err(e) => {
                upload_errors.push(UploadError {
                    file: original,
                    error: e.to_string(),
                });
                continue;
            }
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read {}: {}", name, e)))?;
        let path = upload_dir.join(&name);
        match tokio::fs::write(&path, &bytes).await {
            Ok(()) => {
                tracing::info!(file = %name, bytes = bytes.len(), "uploaded");
                saved.push(path);
            }
            Err(e) => upload_errors.push(UploadError {
                file: name,
                error: e.to_string(),
            }),
        }
    }

    if saved.is_empty() {
        let mut err = bad_request("no files uploaded");
        err.details = Some(serde_json::json!({ "upload_errors": upload_errors }));
        return Err(err);
    }

    let files: Vec<String> = saved
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .collect();
    let mut request = IndexRequest::incremental(saved);
    request.force_reembed = true;
    let result = app.indexer.run(request).await?;

    let status = match result.status {
        RunStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    Ok((
        status,
        Json(UploadResponse {
            message: format!("{} files uploaded and indexed", files.len()),
            files,
            result,
            upload_errors,
        }),
    )
        .into_response())
}

// ============ Search ============

async fn handle_file_search(State(app): State<App>, body: Bytes) -> Result<Response, AppError> {
    let request: LocalSearchRequest = parse_body(&body)?;
    let response = app.engine.search_local(request).await?;
    Ok(Json(response).into_response())
}

async fn handle_web_search(
    State(app): State<App>,
    params: Result<Query<WebSearchRequest>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(request) = params.map_err(|e| bad_request(e.body_text()))?;
    let response = app.engine.search_web(request).await?;
    if response.all_failed() {
        return Err(web_failure(&response));
    }
    Ok(Json(response).into_response())
}

/// 504 when every engine ran out of time, 502 otherwise.
fn web_failure(response: &WebSearchResponse) -> AppError {
    let (status, code, what) = if response.all_timed_out() {
        (StatusCode::GATEWAY_TIMEOUT, "web_search_timeout", "timed out")
    } else {
        (StatusCode::BAD_GATEWAY, "web_search_failed", "failed")
    };
    let mut err = app_error(
        status,
        code,
        format!(
            "all web search engines {}: {}",
            what,
            response.attempted_engines.join(", ")
        ),
    );
    err.details = Some(serde_json::json!({
        "attempted_engines": response.attempted_engines,
        "attempt_errors": response.attempt_errors,
    }));
    err
}

fn parse_flag(value: &str) -> Result<bool, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(bad_request(format!("expected a boolean, got '{}'", other))),
    }
}

fn parse_count(name: &str, value: &str) -> Result<Option<usize>, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| bad_request(format!("{} must be a positive integer", name)))
}

async fn handle_ask_with_file(
    State(app): State<App>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut request = AskWithFileRequest {
        user_id: None,
        query: String::new(),
        file_name: String::new(),
        file_bytes: Vec::new(),
        engine: None,
        local_top_k: None,
        web_top_n: None,
        scrape_web: false,
        restrict_local_to_file: true,
    };
    let mut files = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            files += 1;
            request.file_name = field.file_name().unwrap_or_default().to_string();
            request.file_bytes = field
                .bytes()
                .await
                .map_err(|e| bad_request(format!("failed to read file: {}", e)))?
                .to_vec();
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|e| bad_request(format!("failed to read field {}: {}", name, e)))?;
        match name.as_str() {
            "query" | "q" => request.query = value,
            "user_id" => request.user_id = Some(value),
            "engine" => request.engine = Some(value),
            "local_top_k" => request.local_top_k = parse_count(&name, &value)?,
            "web_top_n" => request.web_top_n = parse_count(&name, &value)?,
            "scrape_web" => request.scrape_web = parse_flag(&value)?,
            "restrict_local_to_file" => request.restrict_local_to_file = parse_flag(&value)?,
            _ => {}
        }
    }

    if files != 1 {
        return Err(bad_request(format!(
            "exactly one file is required, got {}",
            files
        )));
    }
    let response = app.engine.ask_with_file(request).await?;
    Ok(Json(response).into_response())
}

async fn handle_unified_search(
    State(app): State<App>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: UnifiedSearchRequest = parse_body(&body)?;
    let response = app.engine.search_unified(request).await?;
    Ok(Json(response).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag_and_count() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
        assert_eq!(parse_count("k", " 5 ").unwrap(), Some(5));
        assert_eq!(parse_count("k", "").unwrap(), None);
        assert!(parse_count("k", "-1").is_err());
    }

    #[test]
    fn test_parse_body_defaults_on_empty() {
        let body: IndexBody = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(body.roots.is_none());
        let body: IndexBody =
            parse_body(&Bytes::from_static(br#"{"roots":["/a"],"force_reembed":true}"#)).unwrap();
        assert_eq!(body.roots.unwrap(), vec!["/a"]);
        assert!(body.force_reembed);
        assert!(parse_body::<IndexBody>(&Bytes::from_static(b"{")).is_err());
    }

    fn failed_web(timeouts: &[bool]) -> WebSearchResponse {
        let engines = ["exa", "serper"];
        WebSearchResponse {
            results: Vec::new(),
            engine: None,
            attempted_engines: engines[..timeouts.len()].iter().map(|e| e.to_string()).collect(),
            attempt_errors: engines
                .iter()
                .zip(timeouts)
                .map(|(engine, &timed_out)| crate::models::AttemptError {
                    engine: engine.to_string(),
                    error: if timed_out { "timed out after 1s" } else { "HTTP 503" }.to_string(),
                    timed_out,
                })
                .collect(),
            fetches: Vec::new(),
            answer: None,
            answer_sources: None,
            answer_error: None,
            latency_ms: 0,
            query_id: None,
        }
    }

    #[test]
    fn test_web_failure_status() {
        let timed_out = web_failure(&failed_web(&[true, true]));
        assert_eq!(timed_out.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timed_out.code, "web_search_timeout");

        let mixed = web_failure(&failed_web(&[false, true]));
        assert_eq!(mixed.status, StatusCode::BAD_GATEWAY);
        assert_eq!(mixed.code, "web_search_failed");
        let details = mixed.details.unwrap();
        assert_eq!(details["attempted_engines"], serde_json::json!(["exa", "serper"]));
        assert_eq!(details["attempt_errors"][1]["timed_out"], true);
        assert!(details["attempt_errors"][0].get("timed_out").is_none());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let err = handle_not_found(Uri::from_static("/api/v1/nope")).await;
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "not_found");
        assert!(err.message.contains("/api/v1/nope"));
    }
}
