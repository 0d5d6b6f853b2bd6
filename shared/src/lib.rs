use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a workflow. Only `Active` workflows are evaluated by
/// the in-browser tracker, but the engine accepts events for any state.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
}

/// Node role inside a workflow graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Condition,
    Action,
}

/// One step of a workflow graph. `config` holds the node-kind-specific
/// settings (webhook URL, event name, ...), authored by the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub title: String,
    pub kind: NodeKind,
    pub step_order: i32,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
}

/// A workflow graph with its embedded analytics counters.
///
/// Owned by the dashboard CRUD service; the engine reads it and mutates the
/// counters exclusively through atomic increments. Counters are
/// monotonically non-decreasing except on explicit reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub site_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub total_triggers: i64,
    pub total_completions: i64,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// Per-node counter block, keyed by (workflow, node) in storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub triggers: i64,
    pub completions: i64,
    pub failures: i64,
    pub skipped: i64,
    pub conditions_passed: i64,
    pub conditions_failed: i64,
}

/// Kind of a behavioral event reported by the tracker or the engine itself.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Trigger,
    StepEntered,
    StepCompleted,
    ConditionEvaluated,
    ActionExecuted,
    ActionCompleted,
    ActionFailed,
    ActionSkipped,
    WorkflowCompleted,
    WorkflowStopped,
    /// Workflow-emitted tracking event (server-side TrackEvent action)
    Custom,
}

impl EventKind {
    /// Stable wire/storage name, matching the serde snake_case encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::StepEntered => "step_entered",
            Self::StepCompleted => "step_completed",
            Self::ConditionEvaluated => "condition_evaluated",
            Self::ActionExecuted => "action_executed",
            Self::ActionCompleted => "action_completed",
            Self::ActionFailed => "action_failed",
            Self::ActionSkipped => "action_skipped",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowStopped => "workflow_stopped",
            Self::Custom => "custom",
        }
    }
}

/// One behavioral event. Short-lived: rows expire 24 hours after
/// `occurred_at` and are never updated. `run_id` groups all events of one
/// execution instance of a workflow for one visitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub site_id: Uuid,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub visitor_id: String,
    #[serde(default)]
    pub run_id: String,
    pub kind: EventKind,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_title: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
    #[serde(default)]
    pub step_order: Option<i32>,
    #[serde(default)]
    pub execution_time_ms: Option<i64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

/// Per-node slice of a period aggregation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePerformance {
    pub node_id: String,
    pub title: String,
    pub node_type: String,
    pub triggers: i64,
    pub completions: i64,
    pub failures: i64,
    pub avg_execution_time_ms: f64,
}

/// Daily rollup of raw events for one workflow, keyed by
/// (workflow, period_start).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregation {
    pub workflow_id: Uuid,
    pub site_id: Uuid,
    pub period_start: NaiveDate,
    pub triggers: i64,
    pub completions: i64,
    pub conversion_rate: f64,
    pub total_execution_time_ms: i64,
    pub avg_execution_time_ms: f64,
    pub unique_visitors: i64,
    pub unique_sessions: i64,
    pub node_performance: Vec<NodePerformance>,
}

/// One day inside a weekly rollup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyBreakdown {
    pub date: NaiveDate,
    pub triggers: i64,
    pub completions: i64,
}

/// Sun–Sat rollup of daily aggregations, keyed by (workflow, week_start).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyAggregation {
    pub workflow_id: Uuid,
    pub site_id: Uuid,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub triggers: i64,
    pub completions: i64,
    pub conversion_rate: f64,
    pub total_execution_time_ms: i64,
    pub avg_execution_time_ms: f64,
    pub unique_visitors: i64,
    pub unique_sessions: i64,
    pub daily_breakdown: Vec<DailyBreakdown>,
    pub node_performance: Vec<NodePerformance>,
}

/// Calendar-month rollup of weekly aggregations, keyed by
/// (workflow, month, year).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyAggregation {
    pub workflow_id: Uuid,
    pub site_id: Uuid,
    pub month: i32,
    pub year: i32,
    pub triggers: i64,
    pub completions: i64,
    pub conversion_rate: f64,
    pub total_execution_time_ms: i64,
    pub avg_execution_time_ms: f64,
    pub unique_visitors: i64,
    pub unique_sessions: i64,
    pub node_performance: Vec<NodePerformance>,
}

/// Tags attached to one visitor on one site, read by the in-browser
/// condition evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorTagRecord {
    pub site_id: Uuid,
    pub visitor_id: String,
    pub tags: Vec<String>,
}
