// Job Scheduler - central scheduler for the rollup and cleanup jobs
//
// Each job is single-flight twice over: an in-process flag stops a slow
// run from overlapping the next tick, and a Postgres advisory lock stops
// two replicas from rolling up the same period concurrently.

use chrono::{Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::rollups::{week_start_for, RollupJob, RollupOutcome};

// Advisory lock keys, one per job. Arbitrary but stable: changing them
// breaks mutual exclusion during a rolling deploy.
const LOCK_DAILY_ROLLUP: i64 = 914_001;
const LOCK_WEEKLY_ROLLUP: i64 = 914_002;
const LOCK_MONTHLY_ROLLUP: i64 = 914_003;
const LOCK_EVENT_CLEANUP: i64 = 914_004;

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Daily rollup of yesterday's raw events
    pub daily_rollup_cron: String,
    /// Weekly rollup of the week that ended Saturday
    pub weekly_rollup_cron: String,
    /// Monthly rollup of the previous calendar month
    pub monthly_rollup_cron: String,
    /// Expired raw event deletion
    pub cleanup_cron: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            // Shortly after midnight so the day being rolled up is closed
            daily_rollup_cron: "0 10 0 * * *".to_string(),
            // Sundays, after the daily rollup has covered Saturday
            weekly_rollup_cron: "0 20 0 * * Sun".to_string(),
            // First of the month, after daily and weekly
            monthly_rollup_cron: "0 30 0 1 * *".to_string(),
            cleanup_cron: "0 0 * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

/// Shared state handed into every scheduled closure.
#[derive(Clone)]
struct JobContext {
    db_pool: PgPool,
    rollup: RollupJob,
    logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    ctx: JobContext,
    config: JobConfig,
    daily_running: Arc<AtomicBool>,
    weekly_running: Arc<AtomicBool>,
    monthly_running: Arc<AtomicBool>,
    cleanup_running: Arc<AtomicBool>,
}

impl JobScheduler {
    pub async fn new(db_pool: PgPool, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            ctx: JobContext {
                rollup: RollupJob::new(db_pool.clone()),
                db_pool,
                logs: Arc::new(RwLock::new(Vec::new())),
            },
            config,
            daily_running: Arc::new(AtomicBool::new(false)),
            weekly_running: Arc::new(AtomicBool::new(false)),
            monthly_running: Arc::new(AtomicBool::new(false)),
            cleanup_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_daily_rollup().await?;
        self.schedule_weekly_rollup().await?;
        self.schedule_monthly_rollup().await?;
        self.schedule_event_cleanup().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_daily_rollup(&self) -> JobResult<()> {
        let ctx = self.ctx.clone();
        let running = self.daily_running.clone();
        let cron = self.config.daily_rollup_cron.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let ctx = ctx.clone();
            let running = running.clone();

            Box::pin(async move {
                let target = Utc::now().date_naive() - Duration::days(1);
                let rollup = ctx.rollup.clone();
                run_guarded(&ctx, LOCK_DAILY_ROLLUP, &running, "Daily Rollup", || async move {
                    rollup.run_daily(target).await
                })
                .await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled daily rollup ({})", self.config.daily_rollup_cron);
        Ok(())
    }

    async fn schedule_weekly_rollup(&self) -> JobResult<()> {
        let ctx = self.ctx.clone();
        let running = self.weekly_running.clone();
        let cron = self.config.weekly_rollup_cron.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let ctx = ctx.clone();
            let running = running.clone();

            Box::pin(async move {
                // The week ending yesterday (Saturday)
                let target = week_start_for(Utc::now().date_naive() - Duration::days(1));
                let rollup = ctx.rollup.clone();
                run_guarded(&ctx, LOCK_WEEKLY_ROLLUP, &running, "Weekly Rollup", || async move {
                    rollup.run_weekly(target).await
                })
                .await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled weekly rollup ({})", self.config.weekly_rollup_cron);
        Ok(())
    }

    async fn schedule_monthly_rollup(&self) -> JobResult<()> {
        let ctx = self.ctx.clone();
        let running = self.monthly_running.clone();
        let cron = self.config.monthly_rollup_cron.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let ctx = ctx.clone();
            let running = running.clone();

            Box::pin(async move {
                let (year, month) = previous_month(Utc::now().date_naive().year(), Utc::now().date_naive().month());
                let rollup = ctx.rollup.clone();
                run_guarded(&ctx, LOCK_MONTHLY_ROLLUP, &running, "Monthly Rollup", || async move {
                    rollup.run_monthly(year, month).await
                })
                .await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled monthly rollup ({})", self.config.monthly_rollup_cron);
        Ok(())
    }

    async fn schedule_event_cleanup(&self) -> JobResult<()> {
        let ctx = self.ctx.clone();
        let running = self.cleanup_running.clone();
        let cron = self.config.cleanup_cron.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let ctx = ctx.clone();
            let running = running.clone();

            Box::pin(async move {
                let rollup = ctx.rollup.clone();
                run_guarded(&ctx, LOCK_EVENT_CLEANUP, &running, "Event Cleanup", || async move {
                    let deleted = rollup.cleanup_raw_events().await?;
                    Ok(RollupOutcome {
                        workflows_processed: deleted as i32,
                        errors: Vec::new(),
                    })
                })
                .await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled raw event cleanup ({})", self.config.cleanup_cron);
        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.ctx.logs.read().await.clone()
    }

    /// Kick a job immediately, bypassing its cron schedule but not its
    /// single-flight guards.
    pub async fn run_job_now(&self, job_name: &str) -> JobResult<()> {
        let today = Utc::now().date_naive();
        let rollup = self.ctx.rollup.clone();

        match job_name {
            "daily_rollup" => {
                let r = rollup.clone();
                run_guarded(&self.ctx, LOCK_DAILY_ROLLUP, &self.daily_running, "Daily Rollup", move || async move {
                    r.run_daily(today - Duration::days(1)).await
                })
                .await;
            }
            "weekly_rollup" => {
                let r = rollup.clone();
                run_guarded(&self.ctx, LOCK_WEEKLY_ROLLUP, &self.weekly_running, "Weekly Rollup", move || async move {
                    r.run_weekly(week_start_for(today - Duration::days(1))).await
                })
                .await;
            }
            "monthly_rollup" => {
                let (year, month) = previous_month(today.year(), today.month());
                let r = rollup.clone();
                run_guarded(&self.ctx, LOCK_MONTHLY_ROLLUP, &self.monthly_running, "Monthly Rollup", move || async move {
                    r.run_monthly(year, month).await
                })
                .await;
            }
            "event_cleanup" => {
                let r = rollup.clone();
                run_guarded(&self.ctx, LOCK_EVENT_CLEANUP, &self.cleanup_running, "Event Cleanup", move || async move {
                    let deleted = r.cleanup_raw_events().await?;
                    Ok(RollupOutcome {
                        workflows_processed: deleted as i32,
                        errors: Vec::new(),
                    })
                })
                .await;
            }
            _ => return Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }

        Ok(())
    }
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

/// Run one job under both single-flight guards and append an execution
/// log entry. Failures are logged, never propagated: the scheduler must
/// keep ticking.
async fn run_guarded<F, Fut>(
    ctx: &JobContext,
    lock_key: i64,
    running: &AtomicBool,
    job_name: &str,
    op: F,
) where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = JobResult<RollupOutcome>> + Send + 'static,
{
    if running.swap(true, Ordering::SeqCst) {
        warn!("{} is still running, skipping this tick", job_name);
        return;
    }

    // Advisory lock on a dedicated connection, held for the duration of
    // the run so other replicas skip the period.
    let mut conn = match ctx.db_pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("{} could not acquire a connection: {}", job_name, e);
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let locked: bool = match sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(lock_key)
        .fetch_one(&mut *conn)
        .await
    {
        Ok(locked) => locked,
        Err(e) => {
            error!("{} advisory lock query failed: {}", job_name, e);
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    if !locked {
        info!("{} is running on another instance, skipping", job_name);
        running.store(false, Ordering::SeqCst);
        return;
    }

    let log_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!("Running {}", job_name);

    // The job body runs on its own task so that a panic inside it cannot
    // unwind past the advisory unlock below and leave the lock held on a
    // pooled session.
    let outcome = run_isolated(job_name, op()).await;

    let completed_at = Utc::now();
    let duration = (completed_at - started_at).num_milliseconds();

    let log = match outcome {
        Ok(result) => {
            info!(
                "{} completed: {} items processed, {} errors",
                job_name,
                result.workflows_processed,
                result.errors.len()
            );
            JobExecutionLog {
                id: log_id,
                job_name: job_name.to_string(),
                started_at,
                completed_at: Some(completed_at),
                status: if result.errors.is_empty() {
                    JobStatus::Completed
                } else {
                    JobStatus::PartialFailure
                },
                items_processed: result.workflows_processed,
                errors: result.errors,
                duration_ms: Some(duration),
            }
        }
        Err(e) => {
            error!("{} failed: {}", job_name, e);
            JobExecutionLog {
                id: log_id,
                job_name: job_name.to_string(),
                started_at,
                completed_at: Some(completed_at),
                status: JobStatus::Failed,
                items_processed: 0,
                errors: vec![e.to_string()],
                duration_ms: Some(duration),
            }
        }
    };

    {
        let mut logs = ctx.logs.write().await;
        logs.push(log);
        if logs.len() > MAX_EXECUTION_LOGS {
            logs.remove(0);
        }
    }

    if let Err(e) = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
        .bind(lock_key)
        .fetch_one(&mut *conn)
        .await
    {
        warn!("{} advisory unlock failed: {}", job_name, e);
    }

    running.store(false, Ordering::SeqCst);
}

/// Await the job body on a separate task, converting a panic into a
/// failed outcome instead of unwinding through the caller.
async fn run_isolated<Fut>(job_name: &str, fut: Fut) -> JobResult<RollupOutcome>
where
    Fut: std::future::Future<Output = JobResult<RollupOutcome>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(outcome) => outcome,
        Err(e) => Err(JobError::ExecutionError(format!(
            "{} aborted: {}",
            job_name, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_month_wraps_the_year() {
        assert_eq!(previous_month(2025, 1), (2024, 12));
        assert_eq!(previous_month(2025, 3), (2025, 2));
    }

    async fn always_panics() -> JobResult<RollupOutcome> {
        panic!("boom");
    }

    #[tokio::test]
    async fn panicking_job_body_reports_a_failed_outcome() {
        let outcome = run_isolated("Daily Rollup", always_panics()).await;

        match outcome {
            Err(JobError::ExecutionError(msg)) => assert!(msg.contains("Daily Rollup")),
            other => panic!("expected an execution error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn isolated_job_body_passes_its_outcome_through() {
        let outcome = run_isolated("Event Cleanup", async {
            Ok(RollupOutcome {
                workflows_processed: 3,
                errors: Vec::new(),
            })
        })
        .await;

        assert_eq!(outcome.unwrap().workflows_processed, 3);
    }

    #[test]
    fn default_cron_expressions_order_the_tiers() {
        let config = JobConfig::default();
        assert_eq!(config.daily_rollup_cron, "0 10 0 * * *");
        assert_eq!(config.weekly_rollup_cron, "0 20 0 * * Sun");
        assert_eq!(config.monthly_rollup_cron, "0 30 0 1 * *");
        assert_eq!(config.cleanup_cron, "0 0 * * * *");
    }
}
