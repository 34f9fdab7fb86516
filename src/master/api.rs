use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{CronError, Result};
use crate::job::Job;
use crate::master::JobManager;

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub errno: i32,
    pub msg: String,
    pub data: Value,
}

impl ApiResponse {
    fn success(data: impl Serialize) -> Self {
        Self {
            errno: 0,
            msg: "success".to_string(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    fn failure(msg: impl Into<String>) -> Self {
        Self {
            errno: -1,
            msg: msg.into(),
            data: Value::Null,
        }
    }
}

impl<T: Serialize> From<Result<T>> for ApiResponse {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        // errors are reported in the envelope, never in the status line
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[derive(Deserialize)]
struct SaveForm {
    job: String,
}

#[derive(Deserialize)]
struct NameForm {
    name: String,
}

pub fn router(manager: Arc<JobManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/job/save", post(save_job_handler))
        .route("/job/delete", post(delete_job_handler))
        .route("/job/list", get(list_jobs_handler))
        .route("/job/kill", post(kill_job_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(manager)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    manager: Arc<JobManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        CronError::Io(e)
    })?;
    tracing::info!(addr = %addr, "Starting job management API");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn save_job_handler(
    State(manager): State<Arc<JobManager>>,
    Form(form): Form<SaveForm>,
) -> ApiResponse {
    let job: Job = match serde_json::from_str(&form.job) {
        Ok(job) => job,
        Err(e) => return ApiResponse::failure(format!("invalid job: {e}")),
    };
    manager.save_job(&job).await.into()
}

async fn delete_job_handler(
    State(manager): State<Arc<JobManager>>,
    Form(form): Form<NameForm>,
) -> ApiResponse {
    manager.delete_job(&form.name).await.into()
}

async fn list_jobs_handler(State(manager): State<Arc<JobManager>>) -> ApiResponse {
    manager.list_jobs().await.into()
}

async fn kill_job_handler(
    State(manager): State<Arc<JobManager>>,
    Form(form): Form<NameForm>,
) -> ApiResponse {
    manager.kill_job(&form.name).await.into()
}
