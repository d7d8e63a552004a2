use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::EngineError;
use crate::scheduler::{Job, JobId, SlotAssigner, SlotView};
use crate::store::JobStore;

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn JobStore>,
    pub slots: Arc<RwLock<SlotAssigner>>,
}

#[derive(Serialize)]
struct SlotsResponse {
    total: usize,
    free: usize,
    slots: Vec<SlotView>,
}

#[derive(Serialize)]
struct JobResponse {
    id: JobId,
    user_id: i64,
    kind: String,
    target: String,
    status: String,
    queue_position: Option<i32>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_msg: Option<String>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            user_id: job.user_id,
            kind: job.kind.to_string(),
            target: job.target.to_string(),
            status: job.status().to_string(),
            queue_position: job.queue_position,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error_msg: job.error_msg.clone(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(StatusCode, String);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::JobNotFound(_) => ApiError(StatusCode::NOT_FOUND, e.to_string()),
            _ => ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

/// Read-only status API: slot occupancy and the current queue.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/slots", get(slots_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/jobs/:id", get(job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn slots_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let slots = state.slots.read().await;
    Json(SlotsResponse {
        total: slots.num_slots(),
        free: slots.free_slots(),
        slots: slots.views(),
    })
}

async fn queue_handler(State(state): State<DashboardState>) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let jobs = state.store.list_unfinished().await?;
    Ok(Json(jobs.iter().map(JobResponse::from).collect()))
}

async fn job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<JobId>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .store
        .get(id)
        .await?
        .ok_or(EngineError::JobNotFound(id))?;
    Ok(Json(JobResponse::from(&job)))
}
