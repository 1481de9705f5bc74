//! HTTP + WebSocket surface over a running coordinator.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{Coordinator, Schedule, TaskRequest};
use crate::error::Error;
use crate::task::{Payload, TaskPriority};

/// Longest a `POST /api/tasks` caller may block.
const MAX_WAIT_SECS: f64 = 300.0;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Build the Axum router with task, worker, schedule, and event routes.
pub fn api_routes(coordinator: Arc<Coordinator>) -> Router {
    let state = AppState { coordinator };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/workers", get(list_workers))
        .route("/api/stats", get(stats))
        .route("/api/schedules", post(create_schedule).get(list_schedules))
        .route("/api/schedules/{id}", delete(delete_schedule))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({"error": message.to_string()}))).into_response()
}

fn parse_id(id: &str, what: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-dispatch",
        "running": state.coordinator.is_running(),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(flatten)]
    task: TaskRequest,
    /// Block up to this many seconds for the outcome.
    #[serde(default)]
    wait_secs: Option<f64>,
}

async fn submit_task(State(state): State<AppState>, Json(body): Json<SubmitRequest>) -> Response {
    if body.task.kind.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Task kind must not be empty");
    }

    let task_id = match state.coordinator.submit(body.task).await {
        Ok(id) => id,
        Err(Error::Undeliverable { task_id, reason }) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"task_id": task_id, "error": reason})),
            )
                .into_response();
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    match body.wait_secs.filter(|secs| *secs > 0.0) {
        Some(secs) => {
            let wait = Duration::from_secs_f64(secs.min(MAX_WAIT_SECS));
            let outcome = state.coordinator.wait_for_result(task_id, wait).await;
            (
                StatusCode::OK,
                Json(serde_json::json!({"task_id": task_id, "result": outcome})),
            )
                .into_response()
        }
        None => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"task_id": task_id, "status": "accepted"})),
        )
            .into_response(),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let task_id = match parse_id(&id, "task") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.coordinator.task(task_id).await {
        Some(entry) => (StatusCode::OK, Json(serde_json::json!(entry))).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Task not found"),
    }
}

async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.workers())
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.stats().await)
}

// ── Schedules ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ScheduleRequest {
    kind: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    priority: TaskPriority,
    #[serde(default)]
    interval_secs: Option<f64>,
    #[serde(default)]
    cron: Option<String>,
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<ScheduleRequest>,
) -> Response {
    let coordinator = &state.coordinator;
    let created = match (body.interval_secs, body.cron.as_deref()) {
        (Some(secs), None) => match Schedule::every_secs(secs) {
            Ok(schedule) => Ok(coordinator
                .schedule(body.kind, body.payload, schedule, body.priority)
                .await),
            Err(e) => Err(e),
        },
        (None, Some(expression)) => {
            coordinator
                .schedule_cron(body.kind, body.payload, expression, body.priority)
                .await
        }
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Provide exactly one of interval_secs or cron",
            );
        }
    };

    match created {
        Ok(schedule_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"schedule_id": schedule_id, "status": "scheduled"})),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn list_schedules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.schedules().await)
}

async fn delete_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let schedule_id = match parse_id(&id, "schedule") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.coordinator.unschedule(schedule_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "removed"})),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.coordinator))
}

async fn snapshot(coordinator: &Coordinator) -> serde_json::Value {
    serde_json::json!({
        "type": "snapshot",
        "stats": coordinator.stats().await,
        "workers": coordinator.workers(),
    })
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    value: &serde_json::Value,
) -> Result<(), axum::Error> {
    sink.send(Message::Text(value.to_string().into())).await
}

/// Push task events to one client until either side goes away.
///
/// The client is not expected to send anything; its frames are read only to
/// notice a close.
async fn handle_socket(socket: WebSocket, coordinator: Arc<Coordinator>) {
    // Subscribe before the snapshot so nothing falls between the two.
    let mut events = coordinator.subscribe();
    let (mut sink, mut stream) = socket.split();

    if send_json(&mut sink, &snapshot(&coordinator).await)
        .await
        .is_err()
    {
        warn!("Failed to send initial snapshot, client disconnected");
        return;
    }

    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(other) => debug!(frame = ?other, "Ignoring client frame"),
                Err(e) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
            }
        }
    });

    let reason = loop {
        let frame = tokio::select! {
            _ = &mut reader => break "client closed",
            received = events.recv() => match received {
                Ok(event) => serde_json::to_value(&event).ok(),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "WS client lagged behind events, resending snapshot");
                    Some(snapshot(&coordinator).await)
                }
                Err(RecvError::Closed) => break "event stream closed",
            },
        };
        if let Some(frame) = frame
            && send_json(&mut sink, &frame).await.is_err()
        {
            break "send failed";
        }
    };

    reader.abort();
    info!(reason, "WebSocket connection closed");
}
