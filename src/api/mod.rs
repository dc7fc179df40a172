//! HTTP API
//!
//! Thin dispatch and admin surface over the service layer. Handlers
//! validate input, call one service, and map `AppError` to a status
//! code; no business logic lives here.

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;

use crate::AppState;
use crate::data::{AutoReplyRule, EntityId, Target, TargetKind, TargetStatus};
use crate::error::AppError;
use crate::service::{BatchResult, ExecutionOutcome};

/// Build the API router; state is applied by the caller.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/targets", post(create_target))
        .route("/targets/:id", get(get_target))
        .route("/targets/:id/execute", post(execute_target))
        .route("/targets/execute-batch", post(execute_batch))
        .route("/autoreply/toggle", post(toggle_autoreply))
        .route("/autoreply/rules", get(list_rules).post(create_rule))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id/toggle", post(toggle_task))
        .route("/logs/stream", get(stream_logs))
}

/// Build the metrics router (outside the /api prefix)
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

/// GET /metrics
///
/// Prometheus text exposition.
async fn metrics() -> String {
    crate::metrics::render()
}

#[derive(Debug, Deserialize)]
struct CreateTargetRequest {
    kind: String,
    identifier: String,
    context_id: Option<i64>,
    reason_code: i64,
    reason_detail: Option<String>,
}

/// POST /api/targets
///
/// Enqueue a new moderation target (external creation path).
async fn create_target(
    State(state): State<AppState>,
    Json(request): Json<CreateTargetRequest>,
) -> Result<Json<Target>, AppError> {
    if TargetKind::parse(&request.kind).is_none() {
        return Err(AppError::Validation(format!(
            "unknown target kind: {}",
            request.kind
        )));
    }
    if request.identifier.trim().is_empty() {
        return Err(AppError::Validation("identifier cannot be empty".to_string()));
    }

    let now = chrono::Utc::now();
    let target = Target {
        id: EntityId::new().0,
        kind: request.kind,
        identifier: request.identifier,
        context_id: request.context_id,
        reason_code: request.reason_code,
        reason_detail: request.reason_detail,
        status: TargetStatus::Pending.as_str().to_string(),
        retry_count: 0,
        created_at: now,
        updated_at: now,
    };

    state.db.insert_target(&target).await?;
    Ok(Json(target))
}

/// GET /api/targets/{id}
async fn get_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Target>, AppError> {
    let target = state.db.get_target(&id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(target))
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteTargetRequest {
    /// Accounts to report through; defaults to every usable account
    #[serde(default)]
    account_ids: Vec<String>,
}

/// POST /api/targets/{id}/execute
///
/// Direct dispatch of one target.
async fn execute_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<ExecuteTargetRequest>>,
) -> Result<Json<ExecutionOutcome>, AppError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();

    let account_ids = if request.account_ids.is_empty() {
        state
            .pool
            .active_accounts(None)
            .await?
            .into_iter()
            .filter(|account| account.is_usable())
            .map(|account| account.id)
            .collect()
    } else {
        request.account_ids
    };

    let outcome = state
        .executor
        .execute_report(&id, &account_ids, &state.shutdown)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct ExecuteBatchRequest {
    limit: Option<i64>,
}

/// POST /api/targets/execute-batch
///
/// Process pending queue entries; returns partial results.
async fn execute_batch(
    State(state): State<AppState>,
    request: Option<Json<ExecuteBatchRequest>>,
) -> Result<Json<BatchResult>, AppError> {
    let limit = request
        .and_then(|Json(request)| request.limit)
        .unwrap_or(50);

    let result = state.executor.execute_batch(limit, &state.shutdown).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

/// POST /api/autoreply/toggle
///
/// Standalone auto-reply activation path; independent of any
/// scheduler-registered task.
async fn toggle_autoreply(
    State(state): State<AppState>,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if request.enabled {
        state.autoreply.enable().await;
    } else {
        state.autoreply.disable().await;
    }

    Ok(Json(serde_json::json!({
        "enabled": state.autoreply.is_enabled().await,
    })))
}

#[derive(Debug, Deserialize)]
struct CreateRuleRequest {
    keyword: Option<String>,
    response: String,
    #[serde(default)]
    priority: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_true() -> bool {
    true
}

/// GET /api/autoreply/rules
async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<AutoReplyRule>>, AppError> {
    let rules = state.db.list_active_rules().await?;
    Ok(Json(rules))
}

/// POST /api/autoreply/rules
async fn create_rule(
    State(state): State<AppState>,
    Json(request): Json<CreateRuleRequest>,
) -> Result<Json<AutoReplyRule>, AppError> {
    if request.response.trim().is_empty() {
        return Err(AppError::Validation("response cannot be empty".to_string()));
    }

    let now = chrono::Utc::now();
    let rule = AutoReplyRule {
        id: EntityId::new().0,
        keyword: request
            .keyword
            .map(|keyword| keyword.trim().to_string())
            .filter(|keyword| !keyword.is_empty()),
        response: request.response,
        priority: request.priority,
        is_active: request.is_active,
        created_at: now,
        updated_at: now,
    };

    state.db.insert_rule(&rule).await?;
    Ok(Json(rule))
}

/// GET /api/tasks
async fn list_tasks(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::data::ScheduledTask>>, AppError> {
    let tasks = state.db.list_scheduled_tasks().await?;
    Ok(Json(tasks))
}

/// POST /api/tasks/{id}/toggle
///
/// Enable or disable one scheduled task. Orthogonal to the standalone
/// auto-reply toggle: both paths converge on the same poll cycle.
async fn toggle_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<crate::data::ScheduledTask>, AppError> {
    if state.db.get_scheduled_task(&id).await?.is_none() {
        return Err(AppError::NotFound);
    }

    state.db.set_task_active(&id, request.enabled).await?;
    let task = state
        .db
        .get_scheduled_task(&id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(task))
}

/// GET /api/logs/stream
///
/// Server-Sent Events feed of execution records. Best-effort: a slow
/// consumer drops events instead of back-pressuring executions.
async fn stream_logs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.sink.subscribe();

    let stream = BroadcastStream::new(receiver).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event("log").data(data)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
