//! HTTP/WS handlers (C8/C10/C11/C13 external surface). The log-stream
//! route is a native axum WebSocket upgrade: it subscribes first, then
//! replays buffered history and tails the live broadcast until the
//! client disconnects or the channel closes.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use catalyst_core::git::{publish_remote, Git};
use catalyst_core::store::PreviewFilter;
use catalyst_core::types::Task;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Deserialize)]
pub(crate) struct CreateTaskBody {
    pub project_id: String,
    pub prompt: String,
}

#[derive(Deserialize)]
pub(crate) struct PreviewListQuery {
    pub filter: Option<String>,
}

// ── Task ──────────────────────────────────────────────────────────────────

pub(crate) async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let task_id = state
        .orchestrator
        .execute_task(body.project_id, body.prompt)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "task_id": task_id }))))
}

pub(crate) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, StatusCode> {
    match state.store.get_task(id).await {
        Ok(task) => Ok(Json(task)),
        Err(catalyst_core::error::StoreError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal(e)),
    }
}

/// Sets `cancel_requested` on the task row. Cooperative: the orchestrator
/// and worker manager poll this flag at the next phase boundary rather
/// than being interrupted mid-phase.
pub(crate) async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    match state.store.request_cancel(id).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(catalyst_core::error::StoreError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal(e)),
    }
}

// ── Logs (WebSocket) ────────────────────────────────────────────────────

pub(crate) async fn ws_logs(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_task_logs(socket, state, task_id))
}

/// Subscribes before reading history the way `TaskStreamManager` is
/// designed to be used, then replays history and tails the live
/// broadcast, closing once the stream ends or the client disconnects.
async fn stream_task_logs(mut socket: WebSocket, state: Arc<AppState>, task_id: Uuid) {
    let (history, live_rx) = state.stream.subscribe(task_id).await;

    for line in history {
        if socket.send(Message::Text(line)).await.is_err() {
            return;
        }
    }

    let Some(mut live_rx) = live_rx else {
        let _ = socket.close().await;
        return;
    };

    loop {
        tokio::select! {
            msg = live_rx.recv() => {
                match msg {
                    Ok(line) => {
                        if socket.send(Message::Text(line)).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    return;
                }
            }
        }
    }
}

// ── Preview ───────────────────────────────────────────────────────────────

pub(crate) async fn list_previews(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PreviewListQuery>,
) -> Result<Json<Value>, StatusCode> {
    let filter = match q.filter.as_deref() {
        Some(s) => PreviewFilter::from_str(s).map_err(|_| StatusCode::BAD_REQUEST)?,
        None => PreviewFilter::All,
    };
    let previews = state.store.list_previews(filter).await.map_err(internal)?;
    Ok(Json(json!(previews)))
}

pub(crate) async fn get_preview(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    match state.store.get_preview(task_id).await {
        Ok(preview) => Ok(Json(json!(preview))),
        Err(catalyst_core::error::StoreError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal(e)),
    }
}

pub(crate) async fn delete_preview(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    state.preview.cleanup(task_id).await.map_err(internal)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn cleanup_expired_previews(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let expired = state
        .store
        .list_previews(PreviewFilter::Expired)
        .await
        .map_err(internal)?;
    let mut cleaned = Vec::new();
    for preview in expired {
        if state.preview.cleanup(preview.task_id).await.is_ok() {
            cleaned.push(preview.task_id);
        }
    }
    Ok(Json(json!({ "cleaned_up": cleaned })))
}

// ── Git ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PushResponse {
    pushed: bool,
    branch: String,
}

#[derive(Deserialize)]
pub(crate) struct PrBody {
    title: Option<String>,
    body: Option<String>,
}

fn project_repo_path(state: &AppState, project: &str) -> String {
    format!("{}/{project}", state.config.repo_root)
}

pub(crate) async fn list_git_repos(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&state.config.repo_root)
        .await
        .map_err(internal)?;
    while let Some(entry) = entries.next_entry().await.map_err(internal)? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(Json(json!({ "repos": names })))
}

pub(crate) async fn get_git_repo(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let repo_path = project_repo_path(&state, &project);
    let git = Git::new(repo_path, state.config.git_author_name.clone(), state.config.git_author_email.clone());
    let commits = git.log_oneline(50).map_err(internal)?;
    let branch = git.current_branch().map_err(internal)?;
    let files = git.ls_files().map_err(internal)?;
    Ok(Json(json!({ "project": project, "branch": branch, "commits": commits, "files": files })))
}

pub(crate) async fn push_git_repo(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let repo_path = project_repo_path(&state, &project);
    let git = Git::new(repo_path, state.config.git_author_name.clone(), state.config.git_author_email.clone());
    let branch = git.current_branch().map_err(internal)?;
    git.push_branch("origin", &branch).map_err(internal)?;
    Ok(Json(json!(PushResponse { pushed: true, branch })))
}

pub(crate) async fn open_git_pr(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Json(body): Json<PrBody>,
) -> Result<Json<Value>, StatusCode> {
    let repo_path = project_repo_path(&state, &project);
    let git = Git::new(repo_path, state.config.git_author_name.clone(), state.config.git_author_email.clone());
    let branch = git.current_branch().map_err(internal)?;
    let title = body.title.unwrap_or_else(|| format!("catalyst: update {project}"));
    let body_text = body.body.unwrap_or_default();
    let outcome = publish_remote(
        &git,
        state.forge.as_ref(),
        &state.config.git_mode,
        &project,
        &branch,
        &title,
        &body_text,
    )
    .await;
    Ok(Json(json!({
        "pushed": outcome.pushed,
        "pr_url": outcome.pr_url,
        "skip_reason": outcome.skip_reason,
    })))
}

// ── Health ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let report = state.health.check().await;
    Json(json!({
        "overall": report.overall,
        "services": report.services,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "timestamp": chrono::Utc::now(),
    }))
}
