// Workflow analytics endpoints, read by the dashboard

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::analytics::funnel::{funnel_from_events, FunnelAnalytics};
use crate::analytics::queries;
use crate::identity::CallerIdentity;
use crate::{ApiResult, AppError, AppState};
use siteflow_shared::WorkflowDefinition;

#[derive(Debug, Deserialize)]
pub struct PerformanceQuery {
    /// daily (default), weekly, monthly
    pub period: Option<String>,
    /// Number of periods to return, capped at 90
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
}

/// Optional event window; reads are floored to the 24h retention window
/// regardless of what is asked for.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRangeQuery {
    pub start_date: Option<chrono::DateTime<Utc>>,
    pub end_date: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PerformanceResponse {
    Daily(Vec<siteflow_shared::DailyAggregation>),
    Weekly(Vec<siteflow_shared::WeeklyAggregation>),
    Monthly(Vec<siteflow_shared::MonthlyAggregation>),
}

/// Load the workflow and enforce ownership in one place. A valid id
/// owned by someone else is a 403, not a 404.
async fn owned_workflow(
    state: &AppState,
    workflow_id: Uuid,
    caller: Uuid,
) -> Result<WorkflowDefinition, AppError> {
    let workflow = queries::fetch_workflow(&state.db_pool, workflow_id)
        .await?
        .ok_or_else(|| AppError::not_found("Workflow"))?;

    if workflow.owner_id != caller {
        return Err(AppError::forbidden("Workflow belongs to another account"));
    }
    Ok(workflow)
}

pub async fn get_summary(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<queries::WorkflowAnalyticsSummary>> {
    let workflow = owned_workflow(&state, workflow_id, caller.user_id).await?;
    let summary = queries::workflow_summary(&state.db_pool, &workflow).await?;
    Ok(Json(summary))
}

pub async fn get_funnel(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(workflow_id): Path<Uuid>,
    Query(range): Query<DateRangeQuery>,
) -> ApiResult<Json<FunnelAnalytics>> {
    owned_workflow(&state, workflow_id, caller.user_id).await?;

    let events = queries::events_for_workflow(
        &state.db_pool,
        workflow_id,
        range.start_date,
        range.end_date,
    )
    .await?;
    let events = queries::funnel_events(events);
    Ok(Json(funnel_from_events(&events)))
}

pub async fn get_performance(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(workflow_id): Path<Uuid>,
    Query(query): Query<PerformanceQuery>,
) -> ApiResult<Json<PerformanceResponse>> {
    owned_workflow(&state, workflow_id, caller.user_id).await?;

    let limit = query.limit.unwrap_or(30).clamp(1, 90);
    let response = match query.period.as_deref().unwrap_or("daily") {
        "daily" => {
            let to = Utc::now().date_naive();
            let from = to - Duration::days(limit - 1);
            PerformanceResponse::Daily(
                queries::daily_performance(&state.db_pool, workflow_id, from, to).await?,
            )
        }
        "weekly" => PerformanceResponse::Weekly(
            queries::weekly_performance(&state.db_pool, workflow_id, limit).await?,
        ),
        "monthly" => PerformanceResponse::Monthly(
            queries::monthly_performance(&state.db_pool, workflow_id, limit).await?,
        ),
        other => {
            return Err(AppError::bad_request(format!(
                "Unknown period '{}', expected daily, weekly or monthly",
                other
            )))
        }
    };

    Ok(Json(response))
}

pub async fn get_hourly(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<Vec<queries::HourlyBucket>>> {
    owned_workflow(&state, workflow_id, caller.user_id).await?;
    let buckets = queries::hourly_breakdown(&state.db_pool, workflow_id).await?;
    Ok(Json(buckets))
}

pub async fn get_activity(
    State(state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(workflow_id): Path<Uuid>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_workflow(&state, workflow_id, caller.user_id).await?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let events = queries::recent_activity(&state.db_pool, workflow_id, limit).await?;
    Ok(Json(json!({ "events": events })))
}

pub fn analytics_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_summary))
        .route("/:id/funnel", get(get_funnel))
        .route("/:id/performance", get(get_performance))
        .route("/:id/hourly", get(get_hourly))
        .route("/:id/activity", get(get_activity))
}
