// Counter Aggregator - converts behavioral events into atomic counter deltas
//
// The event-to-delta mapping is deterministic and pure; only `apply` touches
// the database, and it does so exclusively through atomic increments so
// concurrent batches against the same workflow never lose updates.

use siteflow_shared::{EventKind, RawEvent};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;
use uuid::Uuid;

/// Counter increments for one node of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDelta {
    pub triggers: i64,
    pub completions: i64,
    pub failures: i64,
    pub skipped: i64,
    pub conditions_passed: i64,
    pub conditions_failed: i64,
}

impl NodeDelta {
    pub fn merge(&mut self, other: &NodeDelta) {
        self.triggers += other.triggers;
        self.completions += other.completions;
        self.failures += other.failures;
        self.skipped += other.skipped;
        self.conditions_passed += other.conditions_passed;
        self.conditions_failed += other.conditions_failed;
    }

    pub fn is_empty(&self) -> bool {
        *self == NodeDelta::default()
    }
}

/// Merged counter increments for one workflow. A batch of N events against
/// the same workflow collapses into one of these, so the batch costs one
/// workflow UPDATE plus one upsert per touched node instead of N writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowDelta {
    pub total_triggers: i64,
    pub total_completions: i64,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    /// Set when the batch contained a trigger, bumping last_triggered_at
    pub touch_last_triggered: bool,
    pub nodes: BTreeMap<String, NodeDelta>,
}

impl WorkflowDelta {
    /// Fold one event into this delta per the fixed event-kind mapping.
    pub fn record(&mut self, event: &RawEvent) {
        match event.kind {
            EventKind::Trigger => {
                self.total_triggers += 1;
                self.total_runs += 1;
                self.touch_last_triggered = true;
                if let Some(node_id) = &event.node_id {
                    self.node_mut(node_id).triggers += 1;
                }
            }
            EventKind::WorkflowCompleted => {
                self.successful_runs += 1;
            }
            EventKind::WorkflowStopped => {
                self.failed_runs += 1;
            }
            EventKind::ConditionEvaluated => {
                let passed = event
                    .success
                    .or_else(|| event.detail.get("result").and_then(|v| v.as_bool()))
                    .unwrap_or(false);
                if let Some(node_id) = &event.node_id {
                    let node = self.node_mut(node_id);
                    if passed {
                        node.conditions_passed += 1;
                    } else {
                        node.conditions_failed += 1;
                    }
                }
            }
            EventKind::ActionCompleted => {
                self.total_completions += 1;
                if let Some(node_id) = &event.node_id {
                    self.node_mut(node_id).completions += 1;
                }
            }
            EventKind::ActionFailed => {
                if let Some(node_id) = &event.node_id {
                    self.node_mut(node_id).failures += 1;
                }
            }
            EventKind::ActionSkipped => {
                if let Some(node_id) = &event.node_id {
                    self.node_mut(node_id).skipped += 1;
                }
            }
            // Funnel-only and custom tracking events carry no counter effect
            EventKind::StepEntered
            | EventKind::StepCompleted
            | EventKind::ActionExecuted
            | EventKind::Custom => {}
        }
    }

    pub fn merge(&mut self, other: &WorkflowDelta) {
        self.total_triggers += other.total_triggers;
        self.total_completions += other.total_completions;
        self.total_runs += other.total_runs;
        self.successful_runs += other.successful_runs;
        self.failed_runs += other.failed_runs;
        self.touch_last_triggered |= other.touch_last_triggered;
        for (node_id, delta) in &other.nodes {
            self.node_mut(node_id).merge(delta);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == WorkflowDelta::default()
    }

    fn node_mut(&mut self, node_id: &str) -> &mut NodeDelta {
        self.nodes.entry(node_id.to_string()).or_default()
    }
}

/// Compute the delta for a single event.
pub fn delta_for_event(event: &RawEvent) -> WorkflowDelta {
    let mut delta = WorkflowDelta::default();
    delta.record(event);
    delta
}

/// Merge a batch of events into one delta per workflow.
pub fn merge_events<'a, I>(events: I) -> HashMap<Uuid, WorkflowDelta>
where
    I: IntoIterator<Item = &'a RawEvent>,
{
    let mut merged: HashMap<Uuid, WorkflowDelta> = HashMap::new();
    for event in events {
        merged.entry(event.workflow_id).or_default().record(event);
    }
    merged
}

/// Derived completion rate, recomputed on read. Never stored: a persisted
/// mirror would need a read-modify-write that races under concurrent
/// completions.
pub fn completion_rate(completions: i64, triggers: i64) -> f64 {
    if triggers <= 0 {
        return 0.0;
    }
    let rate = completions as f64 / triggers as f64 * 100.0;
    (rate.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

/// Applies merged deltas to the workflow store.
#[derive(Clone)]
pub struct CounterAggregator {
    db_pool: PgPool,
}

impl CounterAggregator {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Apply one workflow's merged delta. One atomic UPDATE for the
    /// workflow-level counters, one additive upsert per touched node.
    pub async fn apply(&self, workflow_id: Uuid, delta: &WorkflowDelta) -> Result<(), sqlx::Error> {
        if delta.is_empty() {
            return Ok(());
        }

        let updated = sqlx::query(
            r#"
            UPDATE workflows SET
                total_triggers = total_triggers + $2,
                total_completions = total_completions + $3,
                total_runs = total_runs + $4,
                successful_runs = successful_runs + $5,
                failed_runs = failed_runs + $6,
                last_triggered_at = CASE WHEN $7 THEN NOW() ELSE last_triggered_at END
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(workflow_id)
        .bind(delta.total_triggers)
        .bind(delta.total_completions)
        .bind(delta.total_runs)
        .bind(delta.successful_runs)
        .bind(delta.failed_runs)
        .bind(delta.touch_last_triggered)
        .execute(&self.db_pool)
        .await?;

        if updated.rows_affected() == 0 {
            warn!("Counter delta dropped: workflow {} missing or deleted", workflow_id);
            return Ok(());
        }

        for (node_id, node) in &delta.nodes {
            if node.is_empty() {
                continue;
            }
            // The INSERT...SELECT is restricted to node ids present on the
            // workflow's graph at write time, so stale tracker payloads
            // cannot create orphaned stat rows.
            sqlx::query(
                r#"
                INSERT INTO workflow_node_stats
                    (workflow_id, node_id, triggers, completions, failures, skipped,
                     conditions_passed, conditions_failed)
                SELECT w.id, $2, $3, $4, $5, $6, $7, $8
                FROM workflows w
                WHERE w.id = $1
                  AND w.nodes @> jsonb_build_array(jsonb_build_object('id', $2::text))
                ON CONFLICT (workflow_id, node_id) DO UPDATE SET
                    triggers = workflow_node_stats.triggers + EXCLUDED.triggers,
                    completions = workflow_node_stats.completions + EXCLUDED.completions,
                    failures = workflow_node_stats.failures + EXCLUDED.failures,
                    skipped = workflow_node_stats.skipped + EXCLUDED.skipped,
                    conditions_passed = workflow_node_stats.conditions_passed + EXCLUDED.conditions_passed,
                    conditions_failed = workflow_node_stats.conditions_failed + EXCLUDED.conditions_failed
                "#,
            )
            .bind(workflow_id)
            .bind(node_id)
            .bind(node.triggers)
            .bind(node.completions)
            .bind(node.failures)
            .bind(node.skipped)
            .bind(node.conditions_passed)
            .bind(node.conditions_failed)
            .execute(&self.db_pool)
            .await?;
        }

        Ok(())
    }

    /// Apply a merged batch, one workflow at a time.
    pub async fn apply_batch(
        &self,
        deltas: &HashMap<Uuid, WorkflowDelta>,
    ) -> Result<(), sqlx::Error> {
        for (workflow_id, delta) in deltas {
            self.apply(*workflow_id, delta).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(workflow: Uuid, kind: EventKind, node: Option<&str>) -> RawEvent {
        RawEvent {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            workflow_id: workflow,
            visitor_id: "v1".to_string(),
            run_id: "r1".to_string(),
            kind,
            node_id: node.map(|n| n.to_string()),
            node_title: None,
            node_type: None,
            detail: serde_json::Value::Null,
            step_order: None,
            execution_time_ms: None,
            success: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn trigger_increments_runs_and_node_triggers() {
        let wf = Uuid::new_v4();
        let delta = delta_for_event(&event(wf, EventKind::Trigger, Some("N1")));

        assert_eq!(delta.total_triggers, 1);
        assert_eq!(delta.total_runs, 1);
        assert!(delta.touch_last_triggered);
        assert_eq!(delta.nodes.get("N1").unwrap().triggers, 1);
    }

    #[test]
    fn condition_result_routes_to_passed_or_failed() {
        let wf = Uuid::new_v4();

        let mut passed = event(wf, EventKind::ConditionEvaluated, Some("C1"));
        passed.success = Some(true);
        let delta = delta_for_event(&passed);
        assert_eq!(delta.nodes.get("C1").unwrap().conditions_passed, 1);
        assert_eq!(delta.nodes.get("C1").unwrap().conditions_failed, 0);

        let mut failed = event(wf, EventKind::ConditionEvaluated, Some("C1"));
        failed.success = Some(false);
        let delta = delta_for_event(&failed);
        assert_eq!(delta.nodes.get("C1").unwrap().conditions_failed, 1);
    }

    #[test]
    fn condition_result_falls_back_to_detail_payload() {
        let wf = Uuid::new_v4();
        let mut evt = event(wf, EventKind::ConditionEvaluated, Some("C1"));
        evt.detail = serde_json::json!({"result": true});

        let delta = delta_for_event(&evt);
        assert_eq!(delta.nodes.get("C1").unwrap().conditions_passed, 1);
    }

    #[test]
    fn funnel_only_events_have_no_counter_effect() {
        let wf = Uuid::new_v4();
        for kind in [
            EventKind::StepEntered,
            EventKind::StepCompleted,
            EventKind::ActionExecuted,
        ] {
            assert!(delta_for_event(&event(wf, kind, Some("N1"))).is_empty());
        }
    }

    #[test]
    fn scenario_two_triggers_one_completion() {
        let wf = Uuid::new_v4();
        let events = vec![
            event(wf, EventKind::Trigger, Some("N1")),
            event(wf, EventKind::ActionCompleted, Some("N2")),
            event(wf, EventKind::Trigger, Some("N1")),
        ];

        let merged = merge_events(&events);
        assert_eq!(merged.len(), 1);

        let delta = merged.get(&wf).unwrap();
        assert_eq!(delta.total_triggers, 2);
        assert_eq!(delta.total_completions, 1);
        assert_eq!(delta.nodes.get("N1").unwrap().triggers, 2);
        assert_eq!(delta.nodes.get("N2").unwrap().completions, 1);
    }

    #[test]
    fn batch_merge_equals_sequential_application() {
        let wf_a = Uuid::new_v4();
        let wf_b = Uuid::new_v4();
        let events = vec![
            event(wf_a, EventKind::Trigger, Some("N1")),
            event(wf_b, EventKind::Trigger, Some("N1")),
            event(wf_a, EventKind::ActionCompleted, Some("N2")),
            event(wf_a, EventKind::ActionFailed, Some("N2")),
            event(wf_a, EventKind::WorkflowCompleted, None),
            event(wf_b, EventKind::WorkflowStopped, None),
            event(wf_a, EventKind::ActionSkipped, Some("N3")),
        ];

        let batched = merge_events(&events);

        let mut sequential: HashMap<Uuid, WorkflowDelta> = HashMap::new();
        for evt in &events {
            let single = delta_for_event(evt);
            sequential.entry(evt.workflow_id).or_default().merge(&single);
        }

        assert_eq!(batched, sequential);
    }

    #[test]
    fn merged_batch_touches_each_node_once() {
        let wf = Uuid::new_v4();
        let events: Vec<RawEvent> = (0..50)
            .map(|_| event(wf, EventKind::Trigger, Some("N1")))
            .collect();

        let merged = merge_events(&events);
        let delta = merged.get(&wf).unwrap();
        // 50 events, 1 node row
        assert_eq!(delta.nodes.len(), 1);
        assert_eq!(delta.nodes.get("N1").unwrap().triggers, 50);
        assert_eq!(delta.total_runs, 50);
    }

    #[test]
    fn completion_rate_bounds() {
        assert_eq!(completion_rate(0, 0), 0.0);
        assert_eq!(completion_rate(5, 0), 0.0);
        assert_eq!(completion_rate(1, 2), 50.0);
        assert_eq!(completion_rate(2, 3), 66.7);
        assert_eq!(completion_rate(3, 3), 100.0);
        // Duplicated completions can push past triggers; clamp to 100
        assert_eq!(completion_rate(7, 3), 100.0);
    }
}
