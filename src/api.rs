//! Bearer-authenticated REST surface for programmatic task submission, plus
//! the Telegram webhook endpoint. Lives on the same listener as the agent
//! WebSocket.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::chat::ChatAdapter;
use crate::registry::Registry;
use crate::status::AgentStatusCache;
use crate::store::{NewTask, TaskStore};
use crate::types::{Task, TaskStatus};

/// Request bodies above this are refused with 413.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Sliding-window rate limiter keyed by bearer token.
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let queue = hits.entry(key.to_string()).or_default();
        while let Some(front) = queue.front() {
            if now.duration_since(*front) >= self.window {
                queue.pop_front();
            } else {
                break;
            }
        }
        if queue.len() >= self.max_requests as usize {
            return false;
        }
        queue.push_back(now);
        true
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub store: Arc<TaskStore>,
    pub status: Arc<AgentStatusCache>,
    pub adapter: Arc<ChatAdapter>,
    /// Tasks created over the API flow to the chat adapter for their
    /// approval bubble. Passed in at construction rather than registered
    /// through a process-wide hook.
    pub api_tasks: mpsc::Sender<Task>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Identity of an authenticated API caller, resolved from its bearer token.
#[derive(Clone)]
struct Caller {
    agent_name: String,
}

pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/:task_id", get(get_task))
        .route("/api/agents", get(list_agents))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .merge(api)
        .layer(middleware::from_fn(cors_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Accept CORS preflight and stamp permissive headers on API responses.
async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "authorization, content-type"),
            ],
        )
            .into_response();
    }
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    response
}

async fn auth_middleware(
    State(state): State<ApiState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let Some(agent_name) = state.registry.lookup_by_token(token).await else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    request.extensions_mut().insert(Caller { agent_name });
    Ok(next.run(request).await)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Telegram webhook: parse the platform update and hand it to the adapter.
/// Always 200 so the platform does not retry malformed updates forever.
async fn webhook(State(state): State<ApiState>, Json(raw): Json<serde_json::Value>) -> StatusCode {
    match serde_json::from_value::<teloxide::types::Update>(raw) {
        Ok(update) => {
            let adapter = state.adapter.clone();
            tokio::spawn(async move {
                adapter.handle_update(update).await;
            });
        }
        Err(e) => warn!("Ignoring unparseable webhook update: {}", e),
    }
    StatusCode::OK
}

/// Extract `{to, content}`, naming the first missing field.
fn parse_submit(body: &serde_json::Value) -> Result<(String, String), &'static str> {
    let to = body
        .get("to")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or("missing field: to")?;
    let content = body
        .get("content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or("missing field: content")?;
    Ok((to.to_string(), content.to_string()))
}

async fn submit_task(
    State(state): State<ApiState>,
    axum::Extension(caller): axum::Extension<Caller>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !state.rate_limiter.allow(&caller.agent_name).await {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limit exceeded"})),
        )
            .into_response();
    }

    let (to, content) = match parse_submit(&body) {
        Ok(pair) => pair,
        Err(msg) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response();
        }
    };

    if !state.registry.agent_exists(&to).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown agent: {}", to)})),
        )
            .into_response();
    }

    // chat_id/message_id stay 0 until the adapter posts the approval bubble.
    let task = state
        .store
        .create_task(
            NewTask {
                from: format!("agent:{}", caller.agent_name),
                to,
                content,
                chat_id: 0,
                message_id: 0,
                conversation_id: None,
                parent_task_id: None,
            },
            Vec::new(),
        )
        .await;

    let task = match state
        .store
        .update_status(task.task_id, TaskStatus::AwaitingApproval, None)
        .await
    {
        Ok(task) => task,
        Err(e) => {
            warn!(task_id = %task.task_id, "API task failed approval transition: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if state.api_tasks.send(task.clone()).await.is_err() {
        warn!(task_id = %task.task_id, "API task listener is gone");
    }

    (
        StatusCode::CREATED,
        Json(json!({
            "task_id": task.task_id,
            "status": task.status,
            "message": "任务已创建，等待审批",
        })),
    )
        .into_response()
}

async fn get_task(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    let Ok(task_id) = task_id.parse::<Uuid>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid task id"})),
        )
            .into_response();
    };
    match state.store.get(task_id).await {
        Some(task) => Json(task).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "task not found"})),
        )
            .into_response(),
    }
}

async fn list_agents(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let mut agents = Vec::new();
    for info in state.registry.list_online().await {
        let snap = state.status.snapshot(&info.name).await;
        agents.push(json!({
            "name": info.name,
            "status": "online",
            "connected_at": info.connected_at,
            "last_seen": info.last_seen,
            "owner_id": info.owner_id,
            "running_tasks": snap.running_tasks,
            "completed_count": snap.completed_count,
        }));
    }
    Json(json!({ "agents": agents }))
}
