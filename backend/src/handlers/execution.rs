// Action execution endpoints
//
// The synchronous route blocks until the action (and its retries) has
// finished and reports the outcome; the async route only confirms that
// the job was queued.

use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::actions::{ActionResult, ExecutionJob};
use crate::identity::OptionalCaller;
use crate::{ApiResult, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    pub duration_ms: i64,
    pub attempts: u32,
}

impl From<ActionResult> for ExecuteResponse {
    fn from(result: ActionResult) -> Self {
        Self {
            message: if result.success {
                "Action executed".to_string()
            } else {
                "Action failed".to_string()
            },
            success: result.success,
            result: result.output,
            error: result.error,
            duration_ms: result.duration_ms,
            attempts: result.attempts,
        }
    }
}

pub async fn execute_action(
    State(state): State<Arc<AppState>>,
    OptionalCaller(caller): OptionalCaller,
    Json(job): Json<ExecutionJob>,
) -> ApiResult<Json<ExecuteResponse>> {
    let result = state.executor.execute(&job, caller).await?;
    Ok(Json(result.into()))
}

pub async fn execute_action_async(
    State(state): State<Arc<AppState>>,
    OptionalCaller(caller): OptionalCaller,
    Json(job): Json<ExecutionJob>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    state.queue.enqueue(job, caller)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "queued": true })),
    ))
}

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(execute_action))
        .route("/async", post(execute_action_async))
}
