//! HTTP surface: task records, runs, SSE streams and stop requests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use agentic_rpa::registry::SessionProgress;
use agentic_rpa::{ExecutionEvent, Orchestrator, StopOutcome, TaskId, TaskRecord, TaskStore};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::record_event;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<TaskStore>,
}

#[derive(Deserialize)]
struct TaskRequest {
    prompt: String,
}

#[derive(Serialize)]
struct SessionView {
    task_id: TaskId,
    started_at: DateTime<Utc>,
    stop_requested: bool,
    progress: SessionProgress,
}

pub enum ApiError {
    NotFound(&'static str),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail.to_string()),
            ApiError::Internal(err) => {
                warn!(error = %format!("{err:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/run", post(run_task))
        .route("/tasks/stream", post(stream_task))
        .route("/tasks/stop/{id}", post(stop_task))
        .route("/sessions/{id}", get(get_session))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, orchestrator: Arc<Orchestrator>, store: Arc<TaskStore>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "task API listening");
    axum::serve(listener, router(AppState { orchestrator, store })).await?;
    Ok(())
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskRecord>> {
    Json(state.store.list())
}

async fn get_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Result<Json<TaskRecord>, ApiError> {
    state
        .store
        .get(id)
        .map(Json)
        .ok_or(ApiError::NotFound("Task not found"))
}

async fn run_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> Result<Json<TaskRecord>, ApiError> {
    let record = state.store.create(&request.prompt)?;
    info!(task_id = record.id, "task started");

    let record = match state.orchestrator.run(&request.prompt).await {
        Ok(result) => match result.error.clone() {
            Some(error) => state.store.fail(record.id, &error, Some(result))?,
            None => state.store.complete(record.id, result)?,
        },
        Err(e) => state.store.fail(record.id, &e.to_string(), None)?,
    };
    Ok(Json(record))
}

async fn stream_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let record = state.store.create(&request.prompt)?;
    let id = record.id;
    info!(task_id = id, "streaming task started");

    // The relay keeps draining and recording after the client goes away.
    let (tx, rx) = mpsc::channel::<ExecutionEvent>(32);
    let mut events = state.orchestrator.run_stream(request.prompt, id);
    tokio::spawn(async move {
        let mut client_gone = false;
        while let Some(event) = events.next().await {
            if let Err(e) = record_event(&state.store, id, &event) {
                warn!(task_id = id, error = %format!("{e:#}"), "failed to record task outcome");
            }
            if !client_gone && tx.send(event).await.is_err() {
                client_gone = true;
                info!(task_id = id, "client disconnected; stopping run");
                state.orchestrator.request_stop(id);
            }
        }
    });

    let opening = Event::default()
        .event("task")
        .data(json!({ "task_id": id }).to_string());
    let stream = tokio_stream::once(Ok::<_, Infallible>(opening))
        .chain(ReceiverStream::new(rx).map(|event| Ok(to_sse_event(&event))));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn stop_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Result<Json<Value>, ApiError> {
    match state.orchestrator.request_stop(id) {
        StopOutcome::Stopping => Ok(Json(json!({ "task_id": id, "status": "stopping" }))),
        StopOutcome::NotFound => Err(ApiError::NotFound("Task session not found")),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<TaskId>) -> Result<Json<SessionView>, ApiError> {
    let handle = state
        .orchestrator
        .registry()
        .lookup(id)
        .ok_or(ApiError::NotFound("Task session not found"))?;
    Ok(Json(SessionView {
        task_id: handle.task_id(),
        started_at: handle.started_at(),
        stop_requested: handle.stop_requested(),
        progress: handle.progress(),
    }))
}

/// The SSE event name is the execution event's name; the payload is its data.
fn to_sse_event(event: &ExecutionEvent) -> Event {
    let data = serde_json::to_value(event)
        .ok()
        .and_then(|mut v| v.get_mut("data").map(Value::take))
        .unwrap_or(Value::Null);
    Event::default().event(event.name()).data(data.to_string())
}
