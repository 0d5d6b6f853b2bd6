// Funnel Reconstructor - rebuilds ordered visitor journeys from raw events
//
// Pure read-path logic: takes the time-ordered raw events of one workflow
// and derives step counts, drop-off rates, path frequencies, and timings.

use chrono::{DateTime, Utc};
use serde::Serialize;
use siteflow_shared::{EventKind, RawEvent};
use std::collections::HashMap;

/// One reconstructed step inside a journey.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyStep {
    pub node_id: String,
    pub title: String,
    pub node_type: String,
    pub step_order: i32,
    pub entered_at: DateTime<Utc>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub condition_met: Option<bool>,
}

/// All events of one run id, ordered as the visitor experienced them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorJourney {
    pub run_id: String,
    pub visitor_id: String,
    pub steps: Vec<JourneyStep>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub completed: bool,
}

/// Aggregated view of one funnel position across all journeys.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStep {
    pub title: String,
    pub node_type: String,
    pub step_order: i32,
    pub count: i64,
    pub completed: i64,
    /// count / count(first step) * 100
    pub conversion_rate: f64,
    /// (prev count - count) / prev count * 100; 0 for the first step
    pub drop_off_rate: f64,
    /// completed / count * 100
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropOffEntry {
    pub from_step: String,
    pub to_step: String,
    pub drop_off_count: i64,
    pub drop_off_rate: f64,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathCount {
    pub path: String,
    pub count: i64,
    pub visitor_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTiming {
    pub title: String,
    pub avg_execution_time_ms: f64,
    pub samples: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelAnalytics {
    pub total_journeys: i64,
    pub completed_journeys: i64,
    pub steps: Vec<FunnelStep>,
    pub drop_offs: Vec<DropOffEntry>,
    pub top_paths: Vec<PathCount>,
    pub step_timings: Vec<StepTiming>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn percentage(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        return 0.0;
    }
    round1(numerator as f64 / denominator as f64 * 100.0)
}

/// Group raw events by run id into ordered visitor journeys.
pub fn reconstruct_journeys(events: &[RawEvent]) -> Vec<VisitorJourney> {
    let mut sorted: Vec<&RawEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.occurred_at);

    let mut order: Vec<String> = Vec::new();
    let mut journeys: HashMap<String, VisitorJourney> = HashMap::new();

    for event in sorted {
        let journey = journeys.entry(event.run_id.clone()).or_insert_with(|| {
            order.push(event.run_id.clone());
            VisitorJourney {
                run_id: event.run_id.clone(),
                visitor_id: event.visitor_id.clone(),
                steps: Vec::new(),
                start_time: event.occurred_at,
                end_time: event.occurred_at,
                completed: false,
            }
        });
        journey.end_time = journey.end_time.max(event.occurred_at);

        match event.kind {
            EventKind::StepEntered => {
                let node_id = event.node_id.clone().unwrap_or_default();
                journey.steps.push(JourneyStep {
                    title: event.node_title.clone().unwrap_or_else(|| node_id.clone()),
                    node_type: event.node_type.clone().unwrap_or_else(|| "step".to_string()),
                    step_order: event.step_order.unwrap_or(journey.steps.len() as i32),
                    node_id,
                    entered_at: event.occurred_at,
                    completed: false,
                    completed_at: None,
                    execution_time_ms: None,
                    condition_met: None,
                });
            }
            EventKind::StepCompleted | EventKind::ActionExecuted => {
                if let Some(node_id) = &event.node_id {
                    if let Some(step) = journey
                        .steps
                        .iter_mut()
                        .rev()
                        .find(|s| &s.node_id == node_id)
                    {
                        step.completed = true;
                        step.completed_at = Some(event.occurred_at);
                        if event.execution_time_ms.is_some() {
                            step.execution_time_ms = event.execution_time_ms;
                        }
                    }
                }
                // Reaching an action means the visitor made it through the
                // whole graph, whatever the delivery outcome was.
                if event.kind == EventKind::ActionExecuted {
                    journey.completed = true;
                }
            }
            EventKind::ConditionEvaluated => {
                if let Some(node_id) = &event.node_id {
                    if let Some(step) = journey
                        .steps
                        .iter_mut()
                        .rev()
                        .find(|s| &s.node_id == node_id)
                    {
                        step.condition_met = event
                            .success
                            .or_else(|| event.detail.get("result").and_then(|v| v.as_bool()));
                        if event.execution_time_ms.is_some() {
                            step.execution_time_ms = event.execution_time_ms;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    order
        .into_iter()
        .filter_map(|run_id| journeys.remove(&run_id))
        .collect()
}

/// Compute the full funnel view from reconstructed journeys.
pub fn analyze(journeys: &[VisitorJourney]) -> FunnelAnalytics {
    // Group per-journey steps by (title, type); a journey counts once per
    // key, and completes the key if ANY of its occurrences completed (a
    // re-entered step may only finish on a later pass).
    let mut counts: HashMap<(String, String), (i64, i64, i32)> = HashMap::new();
    for journey in journeys {
        let mut per_key: HashMap<(String, String), (bool, i32)> = HashMap::new();
        for step in &journey.steps {
            let key = (step.title.clone(), step.node_type.clone());
            let entry = per_key.entry(key).or_insert((false, step.step_order));
            entry.0 |= step.completed;
            entry.1 = entry.1.min(step.step_order);
        }
        for (key, (completed, step_order)) in per_key {
            let entry = counts.entry(key).or_insert((0, 0, step_order));
            entry.0 += 1;
            if completed {
                entry.1 += 1;
            }
            entry.2 = entry.2.min(step_order);
        }
    }

    let mut ordered: Vec<((String, String), (i64, i64, i32))> = counts.into_iter().collect();
    ordered.sort_by(|a, b| a.1 .2.cmp(&b.1 .2).then_with(|| a.0.cmp(&b.0)));

    let first_count = ordered.first().map(|(_, (count, _, _))| *count).unwrap_or(0);

    let mut steps = Vec::with_capacity(ordered.len());
    let mut drop_offs = Vec::new();
    let mut prev: Option<(String, i64)> = None;

    for ((title, node_type), (count, completed, step_order)) in &ordered {
        let drop_off_rate = match &prev {
            Some((_, prev_count)) => percentage(prev_count - count, *prev_count),
            None => 0.0,
        };

        if let Some((prev_title, prev_count)) = &prev {
            let drop_off_count = prev_count - count;
            let rate = percentage(drop_off_count, *prev_count);
            drop_offs.push(DropOffEntry {
                from_step: prev_title.clone(),
                to_step: title.clone(),
                drop_off_count,
                drop_off_rate: rate,
                critical: rate > 50.0,
            });
        }

        steps.push(FunnelStep {
            title: title.clone(),
            node_type: node_type.clone(),
            step_order: *step_order,
            count: *count,
            completed: *completed,
            conversion_rate: percentage(*count, first_count),
            drop_off_rate,
            success_rate: percentage(*completed, *count),
        });

        prev = Some((title.clone(), *count));
    }

    FunnelAnalytics {
        total_journeys: journeys.len() as i64,
        completed_journeys: journeys.iter().filter(|j| j.completed).count() as i64,
        steps,
        drop_offs,
        top_paths: top_paths(journeys, 10),
        step_timings: step_timings(journeys),
    }
}

/// Reconstruct and analyze in one pass.
pub fn funnel_from_events(events: &[RawEvent]) -> FunnelAnalytics {
    analyze(&reconstruct_journeys(events))
}

fn top_paths(journeys: &[VisitorJourney], limit: usize) -> Vec<PathCount> {
    let mut paths: HashMap<String, (i64, Vec<String>)> = HashMap::new();

    for journey in journeys {
        if journey.steps.is_empty() {
            continue;
        }
        let path = journey
            .steps
            .iter()
            .map(|s| s.title.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        let entry = paths.entry(path).or_insert((0, Vec::new()));
        entry.0 += 1;
        entry.1.push(journey.visitor_id.clone());
    }

    let mut ranked: Vec<PathCount> = paths
        .into_iter()
        .map(|(path, (count, visitor_ids))| PathCount {
            path,
            count,
            visitor_ids,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
    ranked.truncate(limit);
    ranked
}

fn step_timings(journeys: &[VisitorJourney]) -> Vec<StepTiming> {
    let mut timings: HashMap<String, (i64, i64)> = HashMap::new();

    for journey in journeys {
        for step in &journey.steps {
            if let Some(ms) = step.execution_time_ms {
                let entry = timings.entry(step.title.clone()).or_insert((0, 0));
                entry.0 += ms;
                entry.1 += 1;
            }
        }
    }

    let mut result: Vec<StepTiming> = timings
        .into_iter()
        .map(|(title, (total, samples))| StepTiming {
            title,
            avg_execution_time_ms: round1(total as f64 / samples as f64),
            samples,
        })
        .collect();
    result.sort_by(|a, b| a.title.cmp(&b.title));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    struct EventBuilder {
        site_id: Uuid,
        workflow_id: Uuid,
        seq: i64,
    }

    impl EventBuilder {
        fn new() -> Self {
            Self {
                site_id: Uuid::new_v4(),
                workflow_id: Uuid::new_v4(),
                seq: 0,
            }
        }

        fn event(
            &mut self,
            run: &str,
            visitor: &str,
            kind: EventKind,
            node: &str,
            title: &str,
            step_order: i32,
        ) -> RawEvent {
            self.seq += 1;
            RawEvent {
                id: Uuid::new_v4(),
                site_id: self.site_id,
                workflow_id: self.workflow_id,
                visitor_id: visitor.to_string(),
                run_id: run.to_string(),
                kind,
                node_id: Some(node.to_string()),
                node_title: Some(title.to_string()),
                node_type: Some("step".to_string()),
                detail: serde_json::Value::Null,
                step_order: Some(step_order),
                execution_time_ms: None,
                success: None,
                occurred_at: base_time() + Duration::seconds(self.seq),
            }
        }
    }

    /// Three journeys [A,B,C], [A,B], [A].
    fn three_journeys(b: &mut EventBuilder) -> Vec<RawEvent> {
        let mut events = Vec::new();
        for (run, visitor, depth) in [("r1", "v1", 3), ("r2", "v2", 2), ("r3", "v3", 1)] {
            for (idx, (node, title)) in [("n-a", "A"), ("n-b", "B"), ("n-c", "C")]
                .iter()
                .enumerate()
                .take(depth)
            {
                events.push(b.event(run, visitor, EventKind::StepEntered, node, title, idx as i32));
                events.push(b.event(run, visitor, EventKind::StepCompleted, node, title, idx as i32));
            }
        }
        events
    }

    #[test]
    fn journeys_group_by_run_id() {
        let mut b = EventBuilder::new();
        let events = three_journeys(&mut b);
        let journeys = reconstruct_journeys(&events);

        assert_eq!(journeys.len(), 3);
        assert_eq!(journeys[0].run_id, "r1");
        assert_eq!(journeys[0].steps.len(), 3);
        assert!(journeys[0].steps.iter().all(|s| s.completed));
        assert_eq!(journeys[2].steps.len(), 1);
    }

    #[test]
    fn scenario_funnel_counts_and_rates() {
        let mut b = EventBuilder::new();
        let analytics = funnel_from_events(&three_journeys(&mut b));

        let counts: Vec<i64> = analytics.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![3, 2, 1]);

        let conversion: Vec<f64> = analytics.steps.iter().map(|s| s.conversion_rate).collect();
        assert_eq!(conversion, vec![100.0, 66.7, 33.3]);

        let drop_off: Vec<f64> = analytics.steps.iter().map(|s| s.drop_off_rate).collect();
        assert_eq!(drop_off, vec![0.0, 33.3, 50.0]);

        // 50% is not past the critical threshold
        assert!(analytics.drop_offs.iter().all(|d| !d.critical));
    }

    #[test]
    fn step_counts_are_non_increasing() {
        let mut b = EventBuilder::new();
        let analytics = funnel_from_events(&three_journeys(&mut b));

        for pair in analytics.steps.windows(2) {
            assert!(pair[1].count <= pair[0].count);
        }
    }

    #[test]
    fn drop_off_above_half_is_critical() {
        let mut b = EventBuilder::new();
        let mut events = Vec::new();
        // 3 journeys reach A, only 1 reaches B: 66.7% drop-off
        for (run, visitor) in [("r1", "v1"), ("r2", "v2"), ("r3", "v3")] {
            events.push(b.event(run, visitor, EventKind::StepEntered, "n-a", "A", 0));
        }
        events.push(b.event("r1", "v1", EventKind::StepEntered, "n-b", "B", 1));

        let analytics = funnel_from_events(&events);
        assert_eq!(analytics.drop_offs.len(), 1);
        assert_eq!(analytics.drop_offs[0].drop_off_count, 2);
        assert_eq!(analytics.drop_offs[0].drop_off_rate, 66.7);
        assert!(analytics.drop_offs[0].critical);
    }

    #[test]
    fn action_executed_completes_the_journey() {
        let mut b = EventBuilder::new();
        let events = vec![
            b.event("r1", "v1", EventKind::StepEntered, "n-a", "A", 0),
            b.event("r1", "v1", EventKind::ActionExecuted, "n-a", "A", 0),
            b.event("r2", "v2", EventKind::StepEntered, "n-a", "A", 0),
        ];

        let journeys = reconstruct_journeys(&events);
        assert!(journeys[0].completed);
        assert!(journeys[0].steps[0].completed);
        assert!(!journeys[1].completed);

        let analytics = analyze(&journeys);
        assert_eq!(analytics.total_journeys, 2);
        assert_eq!(analytics.completed_journeys, 1);
        assert_eq!(analytics.steps[0].success_rate, 50.0);
    }

    #[test]
    fn re_entered_step_counts_as_completed_when_any_pass_finishes() {
        let mut b = EventBuilder::new();
        // The visitor enters A twice; only the second pass completes, and
        // reconstruction attaches the completion to the later occurrence.
        let events = vec![
            b.event("r1", "v1", EventKind::StepEntered, "n-a", "A", 0),
            b.event("r1", "v1", EventKind::StepEntered, "n-a", "A", 0),
            b.event("r1", "v1", EventKind::StepCompleted, "n-a", "A", 0),
        ];

        let journeys = reconstruct_journeys(&events);
        assert!(!journeys[0].steps[0].completed);
        assert!(journeys[0].steps[1].completed);

        let analytics = analyze(&journeys);
        assert_eq!(analytics.steps.len(), 1);
        assert_eq!(analytics.steps[0].count, 1);
        assert_eq!(analytics.steps[0].completed, 1);
        assert_eq!(analytics.steps[0].success_rate, 100.0);
    }

    #[test]
    fn condition_results_recorded_on_matching_step() {
        let mut b = EventBuilder::new();
        let mut condition = b.event("r1", "v1", EventKind::ConditionEvaluated, "n-a", "A", 0);
        condition.success = Some(false);
        condition.execution_time_ms = Some(12);

        let events = vec![
            b.event("r1", "v1", EventKind::StepEntered, "n-a", "A", 0),
            condition,
        ];

        let journeys = reconstruct_journeys(&events);
        let step = &journeys[0].steps[0];
        assert_eq!(step.condition_met, Some(false));
        assert_eq!(step.execution_time_ms, Some(12));
    }

    #[test]
    fn paths_ranked_by_frequency_with_visitors() {
        let mut b = EventBuilder::new();
        let mut events = Vec::new();
        for (run, visitor) in [("r1", "v1"), ("r2", "v2")] {
            events.push(b.event(run, visitor, EventKind::StepEntered, "n-a", "A", 0));
            events.push(b.event(run, visitor, EventKind::StepEntered, "n-b", "B", 1));
        }
        events.push(b.event("r3", "v3", EventKind::StepEntered, "n-a", "A", 0));

        let analytics = funnel_from_events(&events);
        assert_eq!(analytics.top_paths[0].path, "A -> B");
        assert_eq!(analytics.top_paths[0].count, 2);
        assert_eq!(analytics.top_paths[0].visitor_ids, vec!["v1", "v2"]);
        assert_eq!(analytics.top_paths[1].path, "A");
    }

    #[test]
    fn step_timings_average_recorded_durations() {
        let mut b = EventBuilder::new();
        let mut events = vec![
            b.event("r1", "v1", EventKind::StepEntered, "n-a", "A", 0),
            b.event("r2", "v2", EventKind::StepEntered, "n-a", "A", 0),
        ];
        let mut done1 = b.event("r1", "v1", EventKind::StepCompleted, "n-a", "A", 0);
        done1.execution_time_ms = Some(100);
        let mut done2 = b.event("r2", "v2", EventKind::StepCompleted, "n-a", "A", 0);
        done2.execution_time_ms = Some(251);
        events.push(done1);
        events.push(done2);

        let analytics = funnel_from_events(&events);
        assert_eq!(analytics.step_timings.len(), 1);
        assert_eq!(analytics.step_timings[0].avg_execution_time_ms, 175.5);
        assert_eq!(analytics.step_timings[0].samples, 2);
    }

    #[test]
    fn empty_input_yields_empty_funnel() {
        let analytics = funnel_from_events(&[]);
        assert_eq!(analytics.total_journeys, 0);
        assert!(analytics.steps.is_empty());
        assert!(analytics.drop_offs.is_empty());
        assert!(analytics.top_paths.is_empty());
    }
}
