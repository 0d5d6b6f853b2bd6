// Rollup Jobs - tiered aggregation of the short-lived raw event log
//
// Daily rollups are computed from raw events before the 24h retention
// window closes over them; weekly rollups sum the dailies and monthly
// rollups sum the weeklies, so history survives raw event expiry.
// Every run recomputes its period wholesale and upserts, which makes
// reruns idempotent.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};
use uuid::Uuid;

use super::scheduler::{JobError, JobResult};
use crate::analytics::aggregator::completion_rate;
use crate::analytics::queries::retention_floor;
use siteflow_shared::{
    DailyAggregation, DailyBreakdown, EventKind, MonthlyAggregation, NodePerformance, RawEvent,
    WeeklyAggregation,
};

/// Outcome of one rollup run. Per-workflow failures are collected, not
/// fatal: one bad workflow must not starve the rest of the tier.
#[derive(Debug, Default)]
pub struct RollupOutcome {
    pub workflows_processed: i32,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct RollupJob {
    db_pool: PgPool,
}

impl RollupJob {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Roll one calendar day of raw events into `daily_aggregations`.
    pub async fn run_daily(&self, day: NaiveDate) -> JobResult<RollupOutcome> {
        let from = day.and_time(NaiveTime::MIN).and_utc();
        let to = from + Duration::days(1);
        let mut outcome = RollupOutcome::default();

        let workflows = self.workflows_with_events(from, to).await?;
        for (workflow_id, site_id) in workflows {
            match self.rollup_one_day(workflow_id, site_id, day, from, to).await {
                Ok(()) => outcome.workflows_processed += 1,
                Err(e) => {
                    warn!("Daily rollup failed for workflow {}: {}", workflow_id, e);
                    outcome
                        .errors
                        .push(format!("workflow {}: {}", workflow_id, e));
                }
            }
        }

        info!(
            "Daily rollup for {}: {} workflows, {} errors",
            day,
            outcome.workflows_processed,
            outcome.errors.len()
        );
        Ok(outcome)
    }

    async fn rollup_one_day(
        &self,
        workflow_id: Uuid,
        site_id: Uuid,
        day: NaiveDate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let events = crate::analytics::queries::events_in_window(
            &self.db_pool,
            workflow_id,
            from,
            to,
        )
        .await?;

        let agg = aggregate_day(workflow_id, site_id, day, &events);
        self.upsert_daily(&agg).await
    }

    async fn upsert_daily(&self, agg: &DailyAggregation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO daily_aggregations (
                workflow_id, site_id, period_start, triggers, completions,
                conversion_rate, total_execution_time_ms, avg_execution_time_ms,
                unique_visitors, unique_sessions, node_performance, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (workflow_id, period_start) DO UPDATE SET
                triggers = EXCLUDED.triggers,
                completions = EXCLUDED.completions,
                conversion_rate = EXCLUDED.conversion_rate,
                total_execution_time_ms = EXCLUDED.total_execution_time_ms,
                avg_execution_time_ms = EXCLUDED.avg_execution_time_ms,
                unique_visitors = EXCLUDED.unique_visitors,
                unique_sessions = EXCLUDED.unique_sessions,
                node_performance = EXCLUDED.node_performance,
                updated_at = NOW()
            "#,
        )
        .bind(agg.workflow_id)
        .bind(agg.site_id)
        .bind(agg.period_start)
        .bind(agg.triggers)
        .bind(agg.completions)
        .bind(agg.conversion_rate)
        .bind(agg.total_execution_time_ms)
        .bind(agg.avg_execution_time_ms)
        .bind(agg.unique_visitors)
        .bind(agg.unique_sessions)
        .bind(sqlx::types::Json(&agg.node_performance))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    /// Roll a Sunday-to-Saturday week of dailies into `weekly_aggregations`.
    pub async fn run_weekly(&self, week_start: NaiveDate) -> JobResult<RollupOutcome> {
        let week_end = week_start + Duration::days(6);
        let mut outcome = RollupOutcome::default();

        let workflow_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT workflow_id FROM daily_aggregations
             WHERE period_start >= $1 AND period_start <= $2",
        )
        .bind(week_start)
        .bind(week_end)
        .fetch_all(&self.db_pool)
        .await?;

        for workflow_id in workflow_ids {
            let result = async {
                let dailies = self
                    .fetch_dailies(workflow_id, week_start, week_end)
                    .await?;
                match aggregate_week(week_start, &dailies) {
                    Some(agg) => self.upsert_weekly(&agg).await,
                    None => Ok(()),
                }
            }
            .await;

            match result {
                Ok(()) => outcome.workflows_processed += 1,
                Err(e) => {
                    warn!("Weekly rollup failed for workflow {}: {}", workflow_id, e);
                    outcome
                        .errors
                        .push(format!("workflow {}: {}", workflow_id, e));
                }
            }
        }

        info!(
            "Weekly rollup for week of {}: {} workflows, {} errors",
            week_start,
            outcome.workflows_processed,
            outcome.errors.len()
        );
        Ok(outcome)
    }

    async fn fetch_dailies(
        &self,
        workflow_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregation>, sqlx::Error> {
        use sqlx::Row;

        let rows = sqlx::query(
            "SELECT workflow_id, site_id, period_start, triggers, completions,
                    conversion_rate, total_execution_time_ms, avg_execution_time_ms,
                    unique_visitors, unique_sessions, node_performance
             FROM daily_aggregations
             WHERE workflow_id = $1 AND period_start >= $2 AND period_start <= $3
             ORDER BY period_start",
        )
        .bind(workflow_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let node_performance: sqlx::types::Json<Vec<NodePerformance>> =
                    row.try_get("node_performance")?;
                Ok(DailyAggregation {
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
                })
            })
            .collect()
    }

    async fn upsert_weekly(&self, agg: &WeeklyAggregation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO weekly_aggregations (
                workflow_id, site_id, week_start, week_end, triggers, completions,
                conversion_rate, total_execution_time_ms, avg_execution_time_ms,
                unique_visitors, unique_sessions, daily_breakdown, node_performance,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (workflow_id, week_start) DO UPDATE SET
                week_end = EXCLUDED.week_end,
                triggers = EXCLUDED.triggers,
                completions = EXCLUDED.completions,
                conversion_rate = EXCLUDED.conversion_rate,
                total_execution_time_ms = EXCLUDED.total_execution_time_ms,
                avg_execution_time_ms = EXCLUDED.avg_execution_time_ms,
                unique_visitors = EXCLUDED.unique_visitors,
                unique_sessions = EXCLUDED.unique_sessions,
                daily_breakdown = EXCLUDED.daily_breakdown,
                node_performance = EXCLUDED.node_performance,
                updated_at = NOW()
            "#,
        )
        .bind(agg.workflow_id)
        .bind(agg.site_id)
        .bind(agg.week_start)
        .bind(agg.week_end)
        .bind(agg.triggers)
        .bind(agg.completions)
        .bind(agg.conversion_rate)
        .bind(agg.total_execution_time_ms)
        .bind(agg.avg_execution_time_ms)
        .bind(agg.unique_visitors)
        .bind(agg.unique_sessions)
        .bind(sqlx::types::Json(&agg.daily_breakdown))
        .bind(sqlx::types::Json(&agg.node_performance))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    /// Roll weeklies whose week_start falls in the given month into
    /// `monthly_aggregations`.
    pub async fn run_monthly(&self, year: i32, month: u32) -> JobResult<RollupOutcome> {
        let month_start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| JobError::ExecutionError(format!("invalid month {}-{}", year, month)))?;
        let next_month = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| JobError::ExecutionError(format!("invalid month {}-{}", year, month)))?;

        let mut outcome = RollupOutcome::default();

        let workflow_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT workflow_id FROM weekly_aggregations
             WHERE week_start >= $1 AND week_start < $2",
        )
        .bind(month_start)
        .bind(next_month)
        .fetch_all(&self.db_pool)
        .await?;

        for workflow_id in workflow_ids {
            let result = async {
                let weeklies = self
                    .fetch_weeklies(workflow_id, month_start, next_month)
                    .await?;
                match aggregate_month(year, month, &weeklies) {
                    Some(agg) => self.upsert_monthly(&agg).await,
                    None => Ok(()),
                }
            }
            .await;

            match result {
                Ok(()) => outcome.workflows_processed += 1,
                Err(e) => {
                    warn!("Monthly rollup failed for workflow {}: {}", workflow_id, e);
                    outcome
                        .errors
                        .push(format!("workflow {}: {}", workflow_id, e));
                }
            }
        }

        info!(
            "Monthly rollup for {}-{:02}: {} workflows, {} errors",
            year,
            month,
            outcome.workflows_processed,
            outcome.errors.len()
        );
        Ok(outcome)
    }

    async fn fetch_weeklies(
        &self,
        workflow_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<WeeklyAggregation>, sqlx::Error> {
        use sqlx::Row;

        let rows = sqlx::query(
            "SELECT workflow_id, site_id, week_start, week_end, triggers, completions,
                    conversion_rate, total_execution_time_ms, avg_execution_time_ms,
                    unique_visitors, unique_sessions, daily_breakdown, node_performance
             FROM weekly_aggregations
             WHERE workflow_id = $1 AND week_start >= $2 AND week_start < $3
             ORDER BY week_start",
        )
        .bind(workflow_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let daily_breakdown: sqlx::types::Json<Vec<DailyBreakdown>> =
                    row.try_get("daily_breakdown")?;
                let node_performance: sqlx::types::Json<Vec<NodePerformance>> =
                    row.try_get("node_performance")?;
                Ok(WeeklyAggregation {
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
                })
            })
            .collect()
    }

    async fn upsert_monthly(&self, agg: &MonthlyAggregation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO monthly_aggregations (
                workflow_id, site_id, month, year, triggers, completions,
                conversion_rate, total_execution_time_ms, avg_execution_time_ms,
                unique_visitors, unique_sessions, node_performance, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (workflow_id, month, year) DO UPDATE SET
                triggers = EXCLUDED.triggers,
                completions = EXCLUDED.completions,
                conversion_rate = EXCLUDED.conversion_rate,
                total_execution_time_ms = EXCLUDED.total_execution_time_ms,
                avg_execution_time_ms = EXCLUDED.avg_execution_time_ms,
                unique_visitors = EXCLUDED.unique_visitors,
                unique_sessions = EXCLUDED.unique_sessions,
                node_performance = EXCLUDED.node_performance,
                updated_at = NOW()
            "#,
        )
        .bind(agg.workflow_id)
        .bind(agg.site_id)
        .bind(agg.month)
        .bind(agg.year)
        .bind(agg.triggers)
        .bind(agg.completions)
        .bind(agg.conversion_rate)
        .bind(agg.total_execution_time_ms)
        .bind(agg.avg_execution_time_ms)
        .bind(agg.unique_visitors)
        .bind(agg.unique_sessions)
        .bind(sqlx::types::Json(&agg.node_performance))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    /// Delete raw events older than the retention window.
    pub async fn cleanup_raw_events(&self) -> JobResult<u64> {
        let floor = retention_floor(Utc::now());
        let result = sqlx::query("DELETE FROM raw_events WHERE occurred_at < $1")
            .bind(floor)
            .execute(&self.db_pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!("Raw event cleanup removed {} expired rows", deleted);
        }
        Ok(deleted)
    }

    async fn workflows_with_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, Uuid)>, sqlx::Error> {
        use sqlx::Row;

        let rows = sqlx::query(
            "SELECT DISTINCT workflow_id, site_id FROM raw_events
             WHERE occurred_at >= $1 AND occurred_at < $2",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("workflow_id")?, row.try_get("site_id")?)))
            .collect()
    }
}

/// The Sunday on or before `date`.
pub fn week_start_for(date: NaiveDate) -> NaiveDate {
    date.week(Weekday::Sun).first_day()
}

/// Compute one workflow's daily aggregation from its raw events.
pub fn aggregate_day(
    workflow_id: Uuid,
    site_id: Uuid,
    day: NaiveDate,
    events: &[RawEvent],
) -> DailyAggregation {
    let mut triggers = 0i64;
    let mut completions = 0i64;
    let mut total_execution_time_ms = 0i64;
    let mut timed_samples = 0i64;
    let mut visitors: HashSet<&str> = HashSet::new();
    let mut sessions: HashSet<&str> = HashSet::new();
    let mut nodes: BTreeMap<String, NodePerf> = BTreeMap::new();

    for event in events {
        match event.kind {
            EventKind::Trigger => triggers += 1,
            EventKind::ActionCompleted => completions += 1,
            _ => {}
        }
        if !event.visitor_id.is_empty() {
            visitors.insert(&event.visitor_id);
        }
        if !event.run_id.is_empty() {
            sessions.insert(&event.run_id);
        }
        if let Some(ms) = event.execution_time_ms {
            total_execution_time_ms += ms;
            timed_samples += 1;
        }

        if let Some(node_id) = &event.node_id {
            let perf = nodes.entry(node_id.clone()).or_default();
            if let Some(title) = &event.node_title {
                if perf.title.is_empty() {
                    perf.title = title.clone();
                }
            }
            if let Some(node_type) = &event.node_type {
                if perf.node_type.is_empty() {
                    perf.node_type = node_type.clone();
                }
            }
            match event.kind {
                EventKind::Trigger | EventKind::StepEntered => perf.triggers += 1,
                EventKind::ActionCompleted | EventKind::StepCompleted => perf.completions += 1,
                EventKind::ActionFailed => perf.failures += 1,
                _ => {}
            }
            if let Some(ms) = event.execution_time_ms {
                perf.total_time_ms += ms;
                perf.timed_samples += 1;
            }
        }
    }

    let node_performance = nodes
        .into_iter()
        .map(|(node_id, perf)| NodePerformance {
            node_id,
            title: perf.title,
            node_type: perf.node_type,
            triggers: perf.triggers,
            completions: perf.completions,
            failures: perf.failures,
            avg_execution_time_ms: if perf.timed_samples > 0 {
                perf.total_time_ms as f64 / perf.timed_samples as f64
            } else {
                0.0
            },
        })
        .collect();

    DailyAggregation {
        workflow_id,
        site_id,
        period_start: day,
        triggers,
        completions,
        conversion_rate: completion_rate(completions, triggers),
        total_execution_time_ms,
        avg_execution_time_ms: if timed_samples > 0 {
            total_execution_time_ms as f64 / timed_samples as f64
        } else {
            0.0
        },
        unique_visitors: visitors.len() as i64,
        unique_sessions: sessions.len() as i64,
        node_performance,
    }
}

#[derive(Default)]
struct NodePerf {
    title: String,
    node_type: String,
    triggers: i64,
    completions: i64,
    failures: i64,
    total_time_ms: i64,
    timed_samples: i64,
}

/// Sum a week of dailies. Unique counts are summed across days; the
/// same visitor returning twice in a week is counted twice, matching
/// how the dailies themselves are built.
pub fn aggregate_week(
    week_start: NaiveDate,
    dailies: &[DailyAggregation],
) -> Option<WeeklyAggregation> {
    let first = dailies.first()?;
    let triggers: i64 = dailies.iter().map(|d| d.triggers).sum();
    let completions: i64 = dailies.iter().map(|d| d.completions).sum();
    let total_execution_time_ms: i64 = dailies.iter().map(|d| d.total_execution_time_ms).sum();

    let daily_breakdown = dailies
        .iter()
        .map(|d| DailyBreakdown {
            date: d.period_start,
            triggers: d.triggers,
            completions: d.completions,
        })
        .collect();

    Some(WeeklyAggregation {
        workflow_id: first.workflow_id,
        site_id: first.site_id,
        week_start,
        week_end: week_start + Duration::days(6),
        triggers,
        completions,
        conversion_rate: completion_rate(completions, triggers),
        total_execution_time_ms,
        avg_execution_time_ms: weighted_avg_time(
            dailies.iter().map(|d| (d.avg_execution_time_ms, d.triggers)),
        ),
        unique_visitors: dailies.iter().map(|d| d.unique_visitors).sum(),
        unique_sessions: dailies.iter().map(|d| d.unique_sessions).sum(),
        daily_breakdown,
        node_performance: merge_node_performance(
            dailies.iter().flat_map(|d| d.node_performance.iter()),
        ),
    })
}

/// Sum the weeklies whose week starts inside the given month.
pub fn aggregate_month(
    year: i32,
    month: u32,
    weeklies: &[WeeklyAggregation],
) -> Option<MonthlyAggregation> {
    let in_month: Vec<&WeeklyAggregation> = weeklies
        .iter()
        .filter(|w| w.week_start.year() == year && w.week_start.month() == month)
        .collect();
    let first = in_month.first()?;

    let triggers: i64 = in_month.iter().map(|w| w.triggers).sum();
    let completions: i64 = in_month.iter().map(|w| w.completions).sum();

    Some(MonthlyAggregation {
        workflow_id: first.workflow_id,
        site_id: first.site_id,
        month: month as i32,
        year,
        triggers,
        completions,
        conversion_rate: completion_rate(completions, triggers),
        total_execution_time_ms: in_month.iter().map(|w| w.total_execution_time_ms).sum(),
        avg_execution_time_ms: weighted_avg_time(
            in_month.iter().map(|w| (w.avg_execution_time_ms, w.triggers)),
        ),
        unique_visitors: in_month.iter().map(|w| w.unique_visitors).sum(),
        unique_sessions: in_month.iter().map(|w| w.unique_sessions).sum(),
        node_performance: merge_node_performance(
            in_month.iter().flat_map(|w| w.node_performance.iter()),
        ),
    })
}

/// Average weighted by trigger volume; equal weights when all zero.
fn weighted_avg_time<I>(parts: I) -> f64
where
    I: Iterator<Item = (f64, i64)> + Clone,
{
    let total_weight: i64 = parts.clone().map(|(_, w)| w).sum();
    if total_weight > 0 {
        parts.map(|(avg, w)| avg * w as f64).sum::<f64>() / total_weight as f64
    } else {
        let values: Vec<f64> = parts.map(|(avg, _)| avg).collect();
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }
}

fn merge_node_performance<'a, I>(parts: I) -> Vec<NodePerformance>
where
    I: Iterator<Item = &'a NodePerformance>,
{
    let mut merged: BTreeMap<String, NodePerformance> = BTreeMap::new();

    for part in parts {
        match merged.get_mut(&part.node_id) {
            Some(existing) => {
                let old_weight = existing.triggers.max(0) as f64;
                let new_weight = part.triggers.max(0) as f64;
                let total_weight = old_weight + new_weight;
                existing.avg_execution_time_ms = if total_weight > 0.0 {
                    (existing.avg_execution_time_ms * old_weight
                        + part.avg_execution_time_ms * new_weight)
                        / total_weight
                } else {
                    (existing.avg_execution_time_ms + part.avg_execution_time_ms) / 2.0
                };
                existing.triggers += part.triggers;
                existing.completions += part.completions;
                existing.failures += part.failures;
                if existing.title.is_empty() {
                    existing.title = part.title.clone();
                }
            }
            None => {
                merged.insert(part.node_id.clone(), part.clone());
            }
        }
    }

    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event(
        workflow_id: Uuid,
        kind: EventKind,
        visitor: &str,
        run: &str,
        node: Option<&str>,
        time_ms: Option<i64>,
    ) -> RawEvent {
        RawEvent {
            id: Uuid::new_v4(),
            site_id: Uuid::nil(),
            workflow_id,
            visitor_id: visitor.to_string(),
            run_id: run.to_string(),
            kind,
            node_id: node.map(str::to_string),
            node_title: node.map(|n| format!("Node {}", n)),
            node_type: node.map(|_| "action".to_string()),
            detail: Value::Null,
            step_order: None,
            execution_time_ms: time_ms,
            success: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn daily_aggregation_counts_and_rates() {
        let wf = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let events = vec![
            event(wf, EventKind::Trigger, "v1", "r1", Some("n1"), None),
            event(wf, EventKind::Trigger, "v2", "r2", Some("n1"), None),
            event(wf, EventKind::Trigger, "v1", "r3", Some("n1"), None),
            event(wf, EventKind::ActionCompleted, "v1", "r1", Some("n2"), Some(120)),
            event(wf, EventKind::ActionFailed, "v2", "r2", Some("n2"), Some(80)),
        ];

        let agg = aggregate_day(wf, Uuid::nil(), day, &events);
        assert_eq!(agg.triggers, 3);
        assert_eq!(agg.completions, 1);
        assert_eq!(agg.conversion_rate, 33.3);
        assert_eq!(agg.unique_visitors, 2);
        assert_eq!(agg.unique_sessions, 3);
        assert_eq!(agg.total_execution_time_ms, 200);
        assert_eq!(agg.avg_execution_time_ms, 100.0);

        let n2 = agg
            .node_performance
            .iter()
            .find(|n| n.node_id == "n2")
            .unwrap();
        assert_eq!(n2.completions, 1);
        assert_eq!(n2.failures, 1);
        assert_eq!(n2.avg_execution_time_ms, 100.0);
    }

    #[test]
    fn daily_aggregation_of_nothing_is_zeroed() {
        let agg = aggregate_day(
            Uuid::new_v4(),
            Uuid::nil(),
            NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            &[],
        );
        assert_eq!(agg.triggers, 0);
        assert_eq!(agg.conversion_rate, 0.0);
        assert_eq!(agg.avg_execution_time_ms, 0.0);
        assert!(agg.node_performance.is_empty());
    }

    fn daily(
        wf: Uuid,
        day: NaiveDate,
        triggers: i64,
        completions: i64,
    ) -> DailyAggregation {
        DailyAggregation {
            workflow_id: wf,
            site_id: Uuid::nil(),
            period_start: day,
            triggers,
            completions,
            conversion_rate: completion_rate(completions, triggers),
            total_execution_time_ms: 0,
            avg_execution_time_ms: 0.0,
            unique_visitors: triggers,
            unique_sessions: triggers,
            node_performance: vec![],
        }
    }

    #[test]
    fn weekly_sums_dailies_and_keeps_breakdown() {
        let wf = Uuid::new_v4();
        let sunday = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        let dailies = vec![
            daily(wf, sunday, 10, 4),
            daily(wf, sunday + Duration::days(1), 6, 2),
            daily(wf, sunday + Duration::days(3), 4, 4),
        ];

        let week = aggregate_week(sunday, &dailies).unwrap();
        assert_eq!(week.week_end, sunday + Duration::days(6));
        assert_eq!(week.triggers, 20);
        assert_eq!(week.completions, 10);
        assert_eq!(week.conversion_rate, 50.0);
        assert_eq!(week.daily_breakdown.len(), 3);
        assert_eq!(week.daily_breakdown[0].date, sunday);
        assert_eq!(week.daily_breakdown[2].completions, 4);
    }

    #[test]
    fn weekly_of_empty_input_is_none() {
        let sunday = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        assert!(aggregate_week(sunday, &[]).is_none());
    }

    #[test]
    fn monthly_only_counts_weeks_starting_in_month() {
        let wf = Uuid::new_v4();
        let feb_week = WeeklyAggregation {
            workflow_id: wf,
            site_id: Uuid::nil(),
            week_start: NaiveDate::from_ymd_opt(2025, 2, 23).unwrap(),
            week_end: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            triggers: 100,
            completions: 50,
            conversion_rate: 50.0,
            total_execution_time_ms: 0,
            avg_execution_time_ms: 0.0,
            unique_visitors: 0,
            unique_sessions: 0,
            daily_breakdown: vec![],
            node_performance: vec![],
        };
        let mut mar_week = feb_week.clone();
        mar_week.week_start = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        mar_week.week_end = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
        mar_week.triggers = 40;
        mar_week.completions = 10;

        let month = aggregate_month(2025, 3, &[feb_week, mar_week]).unwrap();
        assert_eq!(month.triggers, 40);
        assert_eq!(month.completions, 10);
        assert_eq!(month.conversion_rate, 25.0);
    }

    #[test]
    fn week_start_is_the_preceding_sunday() {
        // 2025-03-05 is a Wednesday
        let wednesday = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        assert_eq!(
            week_start_for(wednesday),
            NaiveDate::from_ymd_opt(2025, 3, 2).unwrap()
        );
        // A Sunday maps to itself
        let sunday = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        assert_eq!(week_start_for(sunday), sunday);
    }

    #[test]
    fn node_performance_merges_by_node_id() {
        let a = NodePerformance {
            node_id: "n1".to_string(),
            title: "Send email".to_string(),
            node_type: "action".to_string(),
            triggers: 10,
            completions: 8,
            failures: 1,
            avg_execution_time_ms: 100.0,
        };
        let mut b = a.clone();
        b.triggers = 30;
        b.completions = 20;
        b.avg_execution_time_ms = 200.0;

        let merged = merge_node_performance([&a, &b].into_iter());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].triggers, 40);
        assert_eq!(merged[0].completions, 28);
        // weighted: (100*10 + 200*30) / 40
        assert_eq!(merged[0].avg_execution_time_ms, 175.0);
    }
}
