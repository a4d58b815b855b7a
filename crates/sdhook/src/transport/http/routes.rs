//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::params::SubmitRequest;
use crate::wire;

#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub job_id: String,
    #[serde(default = "default_pop")]
    pub pop: bool,
}

fn default_pop() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// Either a [`SubmitRequest`] object or its hex wire envelope.
    pub params: Value,
    pub worker_index: Option<i64>,
}

impl SubmitJobRequest {
    fn submission(self) -> Result<SubmitRequest, String> {
        match self.params {
            Value::String(envelope) => {
                wire::unpack(&envelope).map_err(|e| format!("Invalid params envelope: {e}"))
            }
            params => serde_json::from_value(params).map_err(|e| format!("Invalid params: {e}")),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match self {
            DispatchError::InvalidParameters(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::NoWorkersAvailable => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::JobNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::Worker(_) | DispatchError::Codec(_) => StatusCode::BAD_GATEWAY,
        };
        error_response(status, self.to_string())
    }
}

async fn root() -> &'static str {
    "OK"
}

async fn health_check(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(dispatcher.health().await)
}

async fn get_worker_infos(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(dispatcher.worker_infos().await)
}

async fn get_status(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<JobRequest>,
) -> impl IntoResponse {
    let status = dispatcher.status(&req.job_id).await;
    Json(json!({ "job_id": req.job_id, "status": status }))
}

async fn get_metadata(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<JobRequest>,
) -> Result<impl IntoResponse, DispatchError> {
    dispatcher
        .metadata(&req.job_id)
        .map(Json)
        .ok_or(DispatchError::JobNotFound(req.job_id))
}

async fn get_progress(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<JobRequest>,
) -> impl IntoResponse {
    Json(dispatcher.progress(&req.job_id).await)
}

async fn get_queue(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<JobRequest>,
) -> impl IntoResponse {
    Json(dispatcher.queue_info(&req.job_id).await)
}

async fn get_image(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<ImageRequest>,
) -> Result<impl IntoResponse, DispatchError> {
    let image = dispatcher.encoded_result(&req.job_id, req.pop).await?;
    Ok(Json(image))
}

async fn submit_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<SubmitJobRequest>,
) -> Response {
    let worker_index = req.worker_index;
    let submission = match req.submission() {
        Ok(submission) => submission,
        Err(msg) => {
            tracing::warn!(error = %msg, "Rejected job submission");
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, msg);
        }
    };

    let result = match submission.into_params() {
        Ok(params) => dispatcher.submit(params, worker_index).await,
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(job_id) => Json(json!({ "job_id": job_id })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Job submission failed");
            e.into_response()
        }
    }
}

async fn cancel(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<JobRequest>,
) -> impl IntoResponse {
    let canceled = dispatcher.cancel(&req.job_id).await;
    Json(json!({ "canceled": canceled }))
}

async fn stats(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(dispatcher.stats().await)
}

pub fn routes(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health-check", get(health_check))
        .route("/get_worker_infos", post(get_worker_infos))
        .route("/get_status", post(get_status))
        .route("/get_metadata", post(get_metadata))
        .route("/get_progress", post(get_progress))
        .route("/get_queue", post(get_queue))
        .route("/get_image", post(get_image))
        .route("/submit_job", post(submit_job))
        .route("/cancel", post(cancel))
        .route("/stats", get(stats))
        .with_state(dispatcher)
}
