use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Result, TaskerError};
use crate::tasker::{TaskConfig, TaskManager, TaskStatus};

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<TaskManager>,
}

#[derive(Deserialize)]
struct ListTasksQuery {
    #[serde(rename = "taskType")]
    task_type: Option<String>,
    /// Comma separated list of statuses
    #[serde(rename = "taskStatus")]
    task_status: Option<String>,
    from: Option<usize>,
    size: Option<usize>,
}

#[derive(Serialize)]
struct CreateTaskResponse {
    id: String,
}

/// REST routes over the task manager.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tasks/type", get(list_types_handler))
        .route("/tasks/task", get(list_tasks_handler))
        .route(
            "/tasks/task/:id",
            get(get_task_handler)
                .post(create_task_handler)
                .delete(cancel_task_handler),
        )
        .layer(cors)
        .with_state(state)
}

/// Serve the REST API until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting REST API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "REST API server stopped");
    Ok(())
}

fn internal_error(e: TaskerError) -> Response {
    tracing::warn!(error = %e, "REST request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

async fn list_types_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.manager.list_supported_task_types())
}

async fn list_tasks_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListTasksQuery>,
) -> Response {
    let statuses = match parse_statuses(query.task_status.as_deref()) {
        Ok(statuses) => statuses,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };

    match state
        .manager
        .list_tasks(
            query.task_type.as_deref(),
            &statuses,
            query.from.unwrap_or(0),
            query.size.unwrap_or(0),
        )
        .await
    {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => internal_error(e),
    }
}

fn parse_statuses(value: Option<&str>) -> std::result::Result<Vec<TaskStatus>, String> {
    value
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<TaskStatus>().map_err(|e| e.to_string()))
        .collect()
}

async fn get_task_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.manager.get_task_status_info(&id).await {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Task not found").into_response(),
        Err(e) => internal_error(e),
    }
}

async fn create_task_handler(
    State(state): State<ApiState>,
    Path(task_type): Path<String>,
    body: Bytes,
) -> Response {
    let task_config = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<TaskConfig>(&body) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("Configuration is invalid for used taskType: {}", e),
                )
                    .into_response()
            }
        }
    };

    match state
        .manager
        .create_task(&task_type, task_config.as_ref())
        .await
    {
        Ok(id) => Json(CreateTaskResponse { id }).into_response(),
        Err(TaskerError::UnsupportedTask(_)) => {
            (StatusCode::BAD_REQUEST, "Used taskType is not supported").into_response()
        }
        Err(TaskerError::TaskConfiguration(msg)) => (
            StatusCode::BAD_REQUEST,
            format!("Configuration is invalid for used taskType: {}", msg),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn cancel_task_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.manager.cancel_task(&id).await {
        Ok(true) => "Task canceled".into_response(),
        Ok(false) => "Task not canceled".into_response(),
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_from_query() {
        assert_eq!(parse_statuses(None), Ok(vec![]));
        assert_eq!(parse_statuses(Some("")), Ok(vec![]));
        assert_eq!(
            parse_statuses(Some("NEW, failover")),
            Ok(vec![TaskStatus::New, TaskStatus::Failover])
        );
        assert!(parse_statuses(Some("NEW,DONE")).is_err());
    }
}
