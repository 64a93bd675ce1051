//! HTTP server exposing the task engine as JSON.

use crate::processor::{BatchReport, Processor};
use crate::registry::{RegistryError, SubmitError};
use crate::resolver::ResolveError;
use crate::task::{Task, TaskId};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub input: PathBuf,
    pub profile: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub dir: PathBuf,
    pub profile: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub replace: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoRejectSetting {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Handler error, rendered as `{"error": ...}` with a matching status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let status = match e {
            SubmitError::QueueFull { .. } | SubmitError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::UnknownProfile(_) | SubmitError::Scan { .. } => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Transition(_) => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        let status = match e {
            ResolveError::NotFound(_) => StatusCode::NOT_FOUND,
            ResolveError::InvalidState { .. } => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

async fn list_tasks(State(processor): State<Processor>) -> Json<Vec<Task>> {
    Json(processor.list_tasks().await)
}

async fn get_task(
    State(processor): State<Processor>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, ApiError> {
    processor
        .get_task(TaskId(id))
        .await
        .map(Json)
        .ok_or_else(|| RegistryError::NotFound(TaskId(id)).into())
}

async fn submit_task(
    State(processor): State<Processor>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    info!(input = %req.input.display(), profile = %req.profile, "task submission");
    let id = processor.submit_task(req.input, req.profile).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

async fn submit_batch(
    State(processor): State<Processor>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchReport>, ApiError> {
    let report = processor.submit_directory(&req.dir, &req.profile).await?;
    Ok(Json(report))
}

async fn cancel_task(
    State(processor): State<Processor>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    processor.cancel_task(TaskId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_task(
    State(processor): State<Processor>,
    Path(id): Path<u64>,
    Json(req): Json<ResolveRequest>,
) -> Result<StatusCode, ApiError> {
    processor.resolve_task(TaskId(id), req.replace).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_profiles(State(processor): State<Processor>) -> Json<Vec<String>> {
    Json(processor.profiles().iter().map(|p| p.name.clone()).collect())
}

async fn get_auto_reject(State(processor): State<Processor>) -> Json<AutoRejectSetting> {
    Json(AutoRejectSetting {
        enabled: processor.auto_reject_enabled(),
    })
}

async fn set_auto_reject(
    State(processor): State<Processor>,
    Json(setting): Json<AutoRejectSetting>,
) -> Json<AutoRejectSetting> {
    processor.set_auto_reject(setting.enabled).await;
    Json(AutoRejectSetting {
        enabled: processor.auto_reject_enabled(),
    })
}

/// Creates the axum Router for the task API
pub fn create_router(processor: Processor) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(submit_task))
        .route("/tasks/batch", post(submit_batch))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/resolve", post(resolve_task))
        .route("/profiles", get(list_profiles))
        .route("/settings/auto-reject", get(get_auto_reject).post(set_auto_reject))
        .with_state(processor)
}

/// Serve the API on `bind` until Ctrl-C or SIGTERM.
pub async fn run_server(processor: Processor, bind: &str) -> Result<(), ServerError> {
    let app = create_router(processor);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = bind, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
