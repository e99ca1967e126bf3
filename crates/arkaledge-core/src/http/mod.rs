//! Read-only observability surface: task snapshot, live event stream, and
//! safe static serving of worktree files.
//!
//! Started alongside orchestration on port 4400 by default. GET-only with
//! permissive CORS; nothing here mutates engine state.

use std::net::SocketAddr;
use std::path::{Component, Path as FsPath, PathBuf};

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use arkaledge_events::EventBus;
use arkaledge_store::{KanbanStore, Task};

/// Default port of the observability server.
pub const DEFAULT_PORT: u16 = 4400;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: msg.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: KanbanStore,
    pub bus: EventBus,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/api/tasks", get(list_tasks))
        .route("/api/events", get(event_stream))
        .route("/api/tasks/{task_id}/worktree", get(worktree_root))
        .route("/api/tasks/{task_id}/worktree/", get(worktree_index))
        .route("/api/tasks/{task_id}/worktree/{*path}", get(worktree_file))
        .layer(cors)
        .with_state(state)
}

/// Serve until cancelled.
pub async fn run_server(state: AppState, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("observability surface listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Result<Response, AppError> {
    let tasks = state.store.get_all_tasks().map_err(AppError::internal)?;

    let rows = if tasks.is_empty() {
        "<tr><td colspan=\"4\">No tasks yet.</td></tr>".to_string()
    } else {
        tasks
            .iter()
            .map(|t| {
                format!(
                    "<tr><td>{id}</td><td>{title}</td><td>{status}</td><td>{assignee}</td></tr>",
                    id = escape_html(&t.id),
                    title = escape_html(&t.title),
                    status = t.status,
                    assignee = escape_html(t.assignee.as_deref().unwrap_or("-")),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>arkaledge</title></head><body>\
<h1>arkaledge</h1>\
<p><a href=\"/api/tasks\">/api/tasks</a> | <a href=\"/api/events\">/api/events</a></p>\
<table><tr><th>ID</th><th>Title</th><th>Status</th><th>Assignee</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = state.store.get_all_tasks().map_err(AppError::internal)?;
    Ok(Json(tasks))
}

/// SSE stream of the wildcard event feed. The subscription ends when the
/// client disconnects (the stream and its receiver are dropped).
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut rx = state.bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    match Event::default().json_data(&event) {
                        Ok(frame) => yield Ok(frame),
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to frame event for SSE");
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "SSE subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream)
}

// ---------------------------------------------------------------------------
// Worktree file serving
// ---------------------------------------------------------------------------

async fn worktree_root(Path(task_id): Path<String>) -> Result<Response, AppError> {
    redirect_301(&format!("/api/tasks/{task_id}/worktree/"))
}

/// Build a 301 redirect to `location`.
fn redirect_301(location: &str) -> Result<Response, AppError> {
    let value = HeaderValue::from_str(location)
        .map_err(|_| AppError::bad_request("redirect target is not a valid header value"))?;
    Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, value)]).into_response())
}

async fn worktree_index(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, AppError> {
    serve_worktree_path(&state, &task_id, "").await
}

async fn worktree_file(
    State(state): State<AppState>,
    Path((task_id, path)): Path<(String, String)>,
) -> Result<Response, AppError> {
    serve_worktree_path(&state, &task_id, &path).await
}

async fn serve_worktree_path(
    state: &AppState,
    task_id: &str,
    raw_path: &str,
) -> Result<Response, AppError> {
    let task = state
        .store
        .get_task(task_id)
        .map_err(|_| AppError::not_found(format!("task {task_id} not found")))?;
    let Some(root) = task.worktree.clone() else {
        return Err(AppError::not_found(format!(
            "task {task_id} has no worktree"
        )));
    };

    let relative = validate_path(raw_path)?;
    let candidate = root.join(&relative);

    // Real-path containment: the resolved target must stay inside the
    // resolved worktree root (catches symlinks that escape it).
    let root_real = root
        .canonicalize()
        .map_err(|_| AppError::not_found("worktree missing on disk"))?;
    let candidate_real = candidate
        .canonicalize()
        .map_err(|_| AppError::not_found(format!("no such file: {raw_path}")))?;
    if !candidate_real.starts_with(&root_real) {
        return Err(AppError::forbidden("path escapes the worktree"));
    }

    if candidate_real.is_dir() {
        // Directories are served only with a trailing slash.
        if !raw_path.is_empty() && !raw_path.ends_with('/') {
            return redirect_301(&format!("/api/tasks/{task_id}/worktree/{raw_path}/"));
        }

        let index = candidate_real.join("index.html");
        if index.is_file() {
            return serve_file(&index);
        }
        return directory_listing(task_id, raw_path, &candidate_real);
    }

    serve_file(&candidate_real)
}

/// Reject traversal and malformed path input; return the cleaned relative
/// path.
fn validate_path(raw_path: &str) -> Result<PathBuf, AppError> {
    if raw_path.contains('\0') {
        return Err(AppError::bad_request("NUL byte in path"));
    }

    let mut clean = PathBuf::new();
    for component in FsPath::new(raw_path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(AppError::bad_request("'..' segments are not allowed"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::bad_request("absolute paths are not allowed"));
            }
        }
    }
    Ok(clean)
}

fn serve_file(path: &FsPath) -> Result<Response, AppError> {
    let bytes = std::fs::read(path).map_err(AppError::internal)?;
    let content_type = content_type_for(path);
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        bytes,
    )
        .into_response())
}

fn directory_listing(task_id: &str, raw_path: &str, dir: &FsPath) -> Result<Response, AppError> {
    let mut names: Vec<String> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
    }
    names.sort();

    let items = names
        .iter()
        .map(|name| {
            format!(
                "<li><a href=\"{href}\">{text}</a></li>",
                href = escape_html(name),
                text = escape_html(name),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>{title}</title></head><body>\
<h1>/{path}</h1><ul>{items}</ul>\
</body></html>",
        title = escape_html(task_id),
        path = escape_html(raw_path),
    );
    Ok(Html(html).into_response())
}

/// Content type by file extension; unknown extensions are served as
/// binary.
fn content_type_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" | "md" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
