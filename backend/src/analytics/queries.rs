// Analytics read paths - workflow summaries, charts, and raw event fetches
//
// Derived rates are recomputed here on every read; nothing in this module
// writes to the store.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use siteflow_shared::{
    DailyAggregation, DailyBreakdown, EventKind, MonthlyAggregation, Node, NodePerformance,
    NodeStats, RawEvent, WeeklyAggregation, WorkflowDefinition, WorkflowStatus,
};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::aggregator::completion_rate;

/// Raw events are retained for 24 hours; every read is floored to that
/// window even if the cleanup job has not run yet.
pub const RAW_EVENT_TTL_HOURS: i64 = 24;

pub fn retention_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(RAW_EVENT_TTL_HOURS)
}

/// Per-node live stats joined with the node metadata from the graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatsView {
    pub node_id: String,
    pub title: String,
    pub kind: String,
    #[serde(flatten)]
    pub stats: NodeStats,
}

/// Workflow-level analytics block served by the summary endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAnalyticsSummary {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub total_triggers: i64,
    pub total_completions: i64,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub completion_rate: f64,
    pub completion_rate_display: String,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub node_stats: Vec<NodeStatsView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub triggers: i64,
    pub completions: i64,
    pub events: i64,
}

/// Load a workflow definition with its live counters. Soft-deleted rows
/// are treated as missing.
pub async fn fetch_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Option<WorkflowDefinition>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, site_id, owner_id, name, status, nodes, edges,
               total_triggers, total_completions, total_runs,
               successful_runs, failed_runs, last_triggered_at,
               created_at, updated_at
        FROM workflows
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let nodes: Json<Vec<Node>> = row.try_get("nodes")?;
    let edges: Json<Vec<siteflow_shared::Edge>> = row.try_get("edges")?;

    Ok(Some(WorkflowDefinition {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        nodes: nodes.0,
        edges: edges.0,
        total_triggers: row.try_get("total_triggers")?,
        total_completions: row.try_get("total_completions")?,
        total_runs: row.try_get("total_runs")?,
        successful_runs: row.try_get("successful_runs")?,
        failed_runs: row.try_get("failed_runs")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

/// Assemble the workflow summary: live counters plus per-node stats, with
/// the completion rate derived on read.
pub async fn workflow_summary(
    pool: &PgPool,
    workflow: &WorkflowDefinition,
) -> Result<WorkflowAnalyticsSummary, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT node_id, triggers, completions, failures, skipped,
               conditions_passed, conditions_failed
        FROM workflow_node_stats
        WHERE workflow_id = $1
        "#,
    )
    .bind(workflow.id)
    .fetch_all(pool)
    .await?;

    let mut node_stats = Vec::with_capacity(rows.len());
    for row in rows {
        let node_id: String = row.try_get("node_id")?;
        let node = workflow.node(&node_id);
        node_stats.push(NodeStatsView {
            title: node.map(|n| n.title.clone()).unwrap_or_else(|| node_id.clone()),
            kind: node
                .map(|n| format!("{:?}", n.kind).to_lowercase())
                .unwrap_or_else(|| "unknown".to_string()),
            node_id,
            stats: NodeStats {
                triggers: row.try_get("triggers")?,
                completions: row.try_get("completions")?,
                failures: row.try_get("failures")?,
                skipped: row.try_get("skipped")?,
                conditions_passed: row.try_get("conditions_passed")?,
                conditions_failed: row.try_get("conditions_failed")?,
            },
        });
    }
    node_stats.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let rate = completion_rate(workflow.total_completions, workflow.total_triggers);

    Ok(WorkflowAnalyticsSummary {
        workflow_id: workflow.id,
        name: workflow.name.clone(),
        status: workflow.status,
        total_triggers: workflow.total_triggers,
        total_completions: workflow.total_completions,
        total_runs: workflow.total_runs,
        successful_runs: workflow.successful_runs,
        failed_runs: workflow.failed_runs,
        completion_rate: rate,
        completion_rate_display: format!("{:.1}%", rate),
        last_triggered_at: workflow.last_triggered_at,
        node_stats,
    })
}

/// Fetch the raw events of one workflow, time-ordered and floored to the
/// 24h retention window.
pub async fn events_for_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<RawEvent>, sqlx::Error> {
    let floor = retention_floor(Utc::now());
    let start = start.map(|s| s.max(floor)).unwrap_or(floor);
    let end = end.unwrap_or_else(Utc::now);
    events_in_window(pool, workflow_id, start, end).await
}

/// Fetch raw events in an exact window, no retention floor. Used by the
/// rollup jobs, which run before the window has expired.
pub async fn events_in_window(
    pool: &PgPool,
    workflow_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<RawEvent>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, site_id, workflow_id, visitor_id, run_id, kind,
               node_id, node_title, node_type, detail, step_order,
               execution_time_ms, success, occurred_at
        FROM raw_events
        WHERE workflow_id = $1 AND occurred_at >= $2 AND occurred_at < $3
        ORDER BY occurred_at ASC
        "#,
    )
    .bind(workflow_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

/// Recent events for the activity feed, newest first. The limit is
/// applied in the query so the full retention window is never loaded.
pub async fn recent_activity(
    pool: &PgPool,
    workflow_id: Uuid,
    limit: i64,
) -> Result<Vec<RawEvent>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, site_id, workflow_id, visitor_id, run_id, kind,
               node_id, node_title, node_type, detail, step_order,
               execution_time_ms, success, occurred_at
        FROM raw_events
        WHERE workflow_id = $1 AND occurred_at >= $2
        ORDER BY occurred_at DESC
        LIMIT $3
        "#,
    )
    .bind(workflow_id)
    .bind(retention_floor(Utc::now()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<RawEvent, sqlx::Error> {
    let detail: Json<serde_json::Value> = row.try_get("detail")?;
    Ok(RawEvent {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        workflow_id: row.try_get("workflow_id")?,
        visitor_id: row.try_get("visitor_id")?,
        run_id: row.try_get("run_id")?,
        kind: row.try_get("kind")?,
        node_id: row.try_get("node_id")?,
        node_title: row.try_get("node_title")?,
        node_type: row.try_get("node_type")?,
        detail: detail.0,
        step_order: row.try_get("step_order")?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        success: row.try_get("success")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

/// Daily aggregation rows for the performance chart.
pub async fn daily_performance(
    pool: &PgPool,
    workflow_id: Uuid,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailyAggregation>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id, site_id, period_start, triggers, completions,
               conversion_rate, total_execution_time_ms, avg_execution_time_ms,
               unique_visitors, unique_sessions, node_performance
        FROM daily_aggregations
        WHERE workflow_id = $1 AND period_start >= $2 AND period_start <= $3
        ORDER BY period_start ASC
        "#,
    )
    .bind(workflow_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    let mut aggregations = Vec::with_capacity(rows.len());
    for row in rows {
        let node_performance: Json<Vec<NodePerformance>> = row.try_get("node_performance")?;
        aggregations.push(DailyAggregation {
            workflow_id: row.try_get("workflow_id")?,
            site_id: row.try_get("site_id")?,
            period_start: row.try_get("period_start")?,
            triggers: row.try_get("triggers")?,
            completions: row.try_get("completions")?,
            conversion_rate: row.try_get("conversion_rate")?,
            total_execution_time_ms: row.try_get("total_execution_time_ms")?,
            avg_execution_time_ms: row.try_get("avg_execution_time_ms")?,
            unique_visitors: row.try_get("unique_visitors")?,
            unique_sessions: row.try_get("unique_sessions")?,
            node_performance: node_performance.0,
        });
    }
    Ok(aggregations)
}

/// Most recent weekly rollups, oldest first.
pub async fn weekly_performance(
    pool: &PgPool,
    workflow_id: Uuid,
    limit: i64,
) -> Result<Vec<WeeklyAggregation>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id, site_id, week_start, week_end, triggers, completions,
               conversion_rate, total_execution_time_ms, avg_execution_time_ms,
               unique_visitors, unique_sessions, daily_breakdown, node_performance
        FROM weekly_aggregations
        WHERE workflow_id = $1
        ORDER BY week_start DESC
        LIMIT $2
        "#,
    )
    .bind(workflow_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut aggregations = Vec::with_capacity(rows.len());
    for row in rows {
        let daily_breakdown: Json<Vec<DailyBreakdown>> = row.try_get("daily_breakdown")?;
        let node_performance: Json<Vec<NodePerformance>> = row.try_get("node_performance")?;
        aggregations.push(WeeklyAggregation {
            workflow_id: row.try_get("workflow_id")?,
            site_id: row.try_get("site_id")?,
            week_start: row.try_get("week_start")?,
            week_end: row.try_get("week_end")?,
            triggers: row.try_get("triggers")?,
            completions: row.try_get("completions")?,
            conversion_rate: row.try_get("conversion_rate")?,
            total_execution_time_ms: row.try_get("total_execution_time_ms")?,
            avg_execution_time_ms: row.try_get("avg_execution_time_ms")?,
            unique_visitors: row.try_get("unique_visitors")?,
            unique_sessions: row.try_get("unique_sessions")?,
            daily_breakdown: daily_breakdown.0,
            node_performance: node_performance.0,
        });
    }
    aggregations.reverse();
    Ok(aggregations)
}

/// Most recent monthly rollups, oldest first.
pub async fn monthly_performance(
    pool: &PgPool,
    workflow_id: Uuid,
    limit: i64,
) -> Result<Vec<MonthlyAggregation>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id, site_id, month, year, triggers, completions,
               conversion_rate, total_execution_time_ms, avg_execution_time_ms,
               unique_visitors, unique_sessions, node_performance
        FROM monthly_aggregations
        WHERE workflow_id = $1
        ORDER BY year DESC, month DESC
        LIMIT $2
        "#,
    )
    .bind(workflow_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut aggregations = Vec::with_capacity(rows.len());
    for row in rows {
        let node_performance: Json<Vec<NodePerformance>> = row.try_get("node_performance")?;
        aggregations.push(MonthlyAggregation {
            workflow_id: row.try_get("workflow_id")?,
            site_id: row.try_get("site_id")?,
            month: row.try_get("month")?,
            year: row.try_get("year")?,
            triggers: row.try_get("triggers")?,
            completions: row.try_get("completions")?,
            conversion_rate: row.try_get("conversion_rate")?,
            total_execution_time_ms: row.try_get("total_execution_time_ms")?,
            avg_execution_time_ms: row.try_get("avg_execution_time_ms")?,
            unique_visitors: row.try_get("unique_visitors")?,
            unique_sessions: row.try_get("unique_sessions")?,
            node_performance: node_performance.0,
        });
    }
    aggregations.reverse();
    Ok(aggregations)
}

/// Hourly trigger/completion buckets from the raw event log.
pub async fn hourly_breakdown(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<HourlyBucket>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT date_trunc('hour', occurred_at) AS hour,
               COUNT(*) FILTER (WHERE kind = 'trigger') AS triggers,
               COUNT(*) FILTER (WHERE kind = 'action_completed') AS completions,
               COUNT(*) AS events
        FROM raw_events
        WHERE workflow_id = $1 AND occurred_at >= $2
        GROUP BY 1
        ORDER BY 1 ASC
        "#,
    )
    .bind(workflow_id)
    .bind(retention_floor(Utc::now()))
    .fetch_all(pool)
    .await?;

    let mut buckets = Vec::with_capacity(rows.len());
    for row in rows {
        buckets.push(HourlyBucket {
            hour: row.try_get("hour")?,
            triggers: row.try_get("triggers")?,
            completions: row.try_get("completions")?,
            events: row.try_get("events")?,
        });
    }
    Ok(buckets)
}

/// Funnel-relevant event kinds, filtered app-side after the bounded fetch.
pub fn funnel_events(events: Vec<RawEvent>) -> Vec<RawEvent> {
    events
        .into_iter()
        .filter(|e| {
            matches!(
                e.kind,
                EventKind::StepEntered
                    | EventKind::StepCompleted
                    | EventKind::ConditionEvaluated
                    | EventKind::ActionExecuted
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_floor_is_24_hours() {
        let now = Utc::now();
        assert_eq!(now - retention_floor(now), Duration::hours(24));
    }
}
