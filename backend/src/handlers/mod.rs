use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::identity::CallerIdentity;
use crate::jobs::{JobError, JobExecutionLog};
use crate::{database, ApiResult, AppError, AppState};

pub mod analytics;
pub mod events;
pub mod execution;
pub mod visitor_tags;

pub use analytics::analytics_routes;
pub use events::event_routes;
pub use execution::execution_routes;
pub use visitor_tags::visitor_tag_routes;

pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let db_healthy = database::health_check(&state.db_pool).await;
    let pool = database::get_pool_stats(&state.db_pool);

    let status = if db_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_healthy { "ok" } else { "degraded" },
            "database": db_healthy,
            "pool": pool,
        })),
    )
}

/// Recent scheduler runs, for operational debugging.
pub async fn job_logs(
    State(state): State<Arc<AppState>>,
    _caller: CallerIdentity,
) -> Json<Vec<JobExecutionLog>> {
    Json(state.scheduler.get_execution_logs().await)
}

/// Trigger a rollup or cleanup run outside its schedule.
pub async fn run_job(
    State(state): State<Arc<AppState>>,
    _caller: CallerIdentity,
    Path(job_name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .scheduler
        .run_job_now(&job_name)
        .await
        .map_err(|e| match e {
            JobError::ConfigError(msg) => AppError::bad_request(msg),
            other => AppError::internal(other.to_string()),
        })?;

    Ok(Json(json!({ "ran": job_name })))
}

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs", get(job_logs))
        .route("/:name/run", post(run_job))
}
