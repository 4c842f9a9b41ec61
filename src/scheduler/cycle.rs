//! Processing cycles: one pass of the pipeline over every eligible user.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::PipelineError;
use crate::pipeline::PipelineOrchestrator;
use crate::pipeline::types::{QueueHealth, QueueStatus, UserFailure};
use crate::scheduler::job::{Job, JobStatus, JobType};
use crate::store::traits::{JobLog, UserProfile, UserStore};

/// Scheduler state, as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Idle,
    Running,
    Completed,
    CompletedWithErrors,
    Disabled,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub job_id: Uuid,
    pub status: CycleStatus,
    pub users_found: usize,
    pub users_processed: usize,
    pub users_skipped: usize,
    pub total_discovered: usize,
    pub total_processed: usize,
    pub total_credits_used: i64,
    pub total_errors: usize,
    pub stale_reaped: usize,
    pub errors: Vec<UserFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CycleReport {
    fn new(job_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: CycleStatus::Running,
            users_found: 0,
            users_processed: 0,
            users_skipped: 0,
            total_discovered: 0,
            total_processed: 0,
            total_credits_used: 0,
            total_errors: 0,
            stale_reaped: 0,
            errors: Vec::new(),
            started_at,
            completed_at: started_at,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One dependency's health line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub ok: bool,
    pub details: String,
}

impl ComponentHealth {
    fn ok(details: impl Into<String>) -> Self {
        Self {
            ok: true,
            details: details.into(),
        }
    }

    fn error(details: impl Into<String>) -> Self {
        Self {
            ok: false,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    pub scheduler: CycleStatus,
    pub checked_at: DateTime<Utc>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub database: ComponentHealth,
    pub queue: ComponentHealth,
    pub queue_status: Option<QueueStatus>,
}

/// Why a user was left out of a cycle without counting as an error.
enum Skip {
    Ineligible(&'static str),
    Missing(PipelineError),
}

pub struct CycleScheduler {
    orchestrator: Arc<PipelineOrchestrator>,
    users: Arc<dyn UserStore>,
    jobs: Arc<dyn JobLog>,
    config: SchedulerConfig,
    enabled: AtomicBool,
    /// Held for the duration of a cycle.
    running: Mutex<()>,
    status: StdMutex<CycleStatus>,
}

impl CycleScheduler {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        users: Arc<dyn UserStore>,
        jobs: Arc<dyn JobLog>,
        config: SchedulerConfig,
    ) -> Self {
        let enabled = AtomicBool::new(config.enabled);
        Self {
            orchestrator,
            users,
            jobs,
            config,
            enabled,
            running: Mutex::new(()),
            status: StdMutex::new(CycleStatus::Idle),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Background processing toggled");
    }

    pub fn status(&self) -> CycleStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: CycleStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Run one cycle. Per-user failures are recorded in the report and
    /// never abort the cycle. A call made while another cycle is running
    /// is rejected.
    pub async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(PipelineError::validation(
                "a processing cycle is already running",
            ));
        };

        let mut job = Job::new(JobType::EmailProcessingCycle);
        let mut report = CycleReport::new(job.id, Utc::now());

        if !self.is_enabled() {
            warn!("Processing cycle skipped: background processing is disabled");
            report.status = CycleStatus::Disabled;
            job.metadata = json!({"cycle_status": report.status});
            if let Err(e) = job.transition_to(JobStatus::Cancelled) {
                warn!("Job bookkeeping: {e}");
            }
            self.persist(&job).await;
            self.set_status(CycleStatus::Disabled);
            return Ok(report);
        }

        self.set_status(CycleStatus::Running);
        if let Err(e) = job.transition_to(JobStatus::Running) {
            warn!("Job bookkeeping: {e}");
        }
        info!(job_id = %job.id, "Starting processing cycle");

        match self.orchestrator.cleanup_stale_processing(None).await {
            Ok(reaped) => report.stale_reaped = reaped,
            Err(e) => warn!(error = %e, "Stale sweep failed"),
        }

        match self.users.list_eligible().await {
            Ok(users) => {
                report.users_found = users.len();
                for user in &users {
                    self.run_user(user, &mut report).await;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to enumerate eligible users");
                report.total_errors += 1;
                report.errors.push(UserFailure::new(None, &e));
            }
        }

        report.completed_at = Utc::now();
        report.status = if report.total_errors > 0 {
            CycleStatus::CompletedWithErrors
        } else {
            CycleStatus::Completed
        };

        job.metadata = cycle_metadata(&report);
        let outcome = if report.total_errors > 0 {
            job.error = Some(format!("{} user(s) failed", report.total_errors));
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        if let Err(e) = job.transition_to(outcome) {
            warn!("Job bookkeeping: {e}");
        }
        self.persist(&job).await;
        self.set_status(report.status);

        info!(
            job_id = %job.id,
            status = %report.status,
            users = report.users_found,
            processed = report.users_processed,
            skipped = report.users_skipped,
            errors = report.total_errors,
            duration_secs = report.duration_secs(),
            "Processing cycle finished"
        );
        Ok(report)
    }

    async fn run_user(&self, user: &UserProfile, report: &mut CycleReport) {
        let user_id = user.user_id.as_str();

        if let Err(skip) = self.recheck(user_id).await {
            report.users_skipped += 1;
            match skip {
                Skip::Ineligible(reason) => info!(user_id, reason, "Skipping user"),
                Skip::Missing(e) => warn!(user_id, error = %e, "Skipping user"),
            }
            return;
        }

        match self.orchestrator.run_full_pipeline(user_id).await {
            Ok(run) => {
                report.users_processed += 1;
                report.total_discovered += run.discovery.new_messages;
                report.total_processed += run.emails_processed();
                report.total_credits_used += run.credits_used();
            }
            Err(e @ PipelineError::NotFound { .. }) => {
                warn!(user_id, error = %e, "Skipping user: connection not found");
                report.users_skipped += 1;
            }
            Err(e) => {
                error!(user_id, error = %e, "Pipeline failed for user");
                report.total_errors += 1;
                report.errors.push(UserFailure::new(Some(user_id), &e));
            }
        }
    }

    /// Eligibility may have changed since the user list was read.
    async fn recheck(&self, user_id: &str) -> Result<(), Skip> {
        let profile = match self.users.get_profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return Err(Skip::Missing(PipelineError::not_found("user", user_id))),
            Err(e) => return Err(Skip::Missing(e)),
        };
        if !profile.bot_enabled {
            return Err(Skip::Ineligible("bot_disabled"));
        }
        if profile.credits_remaining <= 0 {
            return Err(Skip::Ineligible("insufficient_credits"));
        }
        Ok(())
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.jobs.create(job).await {
            error!(job_id = %job.id, error = %e, "Failed to record cycle job");
        }
    }

    /// Aggregate health. Never fails: every problem becomes part of the report.
    pub async fn get_health(&self) -> HealthReport {
        let now = Utc::now();
        let mut status = HealthStatus::Healthy;
        let mut message = "All systems operational.".to_string();

        let (database, last_cycle_at) = match self.jobs.latest(JobType::EmailProcessingCycle).await
        {
            Ok(job) => (
                ComponentHealth::ok("connected"),
                job.map(|j| j.completed_at.or(j.started_at).unwrap_or(j.scheduled_for)),
            ),
            Err(e) => {
                status = HealthStatus::Unhealthy;
                message = "Job log is unreachable.".to_string();
                (ComponentHealth::error(e.to_string()), None)
            }
        };

        let (queue, queue_status) = match self.orchestrator.get_queue_status().await {
            Ok(q) => {
                if q.health != QueueHealth::Healthy && status == HealthStatus::Healthy {
                    status = HealthStatus::Degraded;
                    message = format!("Processing queue is {}.", queue_label(q.health));
                }
                (ComponentHealth::ok(queue_label(q.health)), Some(q))
            }
            Err(e) => {
                status = HealthStatus::Unhealthy;
                message = "Message store is unreachable.".to_string();
                (ComponentHealth::error(e.to_string()), None)
            }
        };

        let stale_after = ChronoDuration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        if let Some(at) = last_cycle_at
            && now - at > stale_after
            && status == HealthStatus::Healthy
        {
            status = HealthStatus::Degraded;
            message = "Last cycle is overdue. The worker might be stalled.".to_string();
        }

        HealthReport {
            status,
            message,
            scheduler: self.status(),
            checked_at: now,
            last_cycle_at,
            database,
            queue,
            queue_status,
        }
    }
}

fn queue_label(health: QueueHealth) -> &'static str {
    match health {
        QueueHealth::Healthy => "healthy",
        QueueHealth::Degraded => "degraded",
        QueueHealth::Overloaded => "overloaded",
    }
}

fn cycle_metadata(report: &CycleReport) -> serde_json::Value {
    json!({
        "cycle_status": report.status,
        "users_found": report.users_found,
        "users_processed": report.users_processed,
        "users_skipped": report.users_skipped,
        "total_discovered": report.total_discovered,
        "total_processed": report.total_processed,
        "total_credits_used": report.total_credits_used,
        "total_errors": report.total_errors,
        "stale_reaped": report.stale_reaped,
        "errors": report.errors,
        "duration_secs": report.duration_secs(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::DatabaseError;
    use crate::store::memory::InMemoryJobLog;
    use crate::store::traits::{CreditLedger, MessageStore};
    use crate::test_support::{Fixture, StubMail, message, profile};

    struct BrokenJobLog;

    #[async_trait]
    impl JobLog for BrokenJobLog {
        async fn create(&self, _job: &Job) -> Result<(), DatabaseError> {
            Err(DatabaseError::Query("disk gone".into()))
        }

        async fn latest(&self, _job_type: JobType) -> Result<Option<Job>, DatabaseError> {
            Err(DatabaseError::Query("disk gone".into()))
        }

        async fn recent(&self, _limit: usize) -> Result<Vec<Job>, DatabaseError> {
            Err(DatabaseError::Query("disk gone".into()))
        }
    }

    fn scheduler_with(fx: &Fixture, jobs: Arc<dyn JobLog>) -> CycleScheduler {
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            fx.collaborators.clone(),
            fx.guards.clone(),
            fx.config.clone(),
        ));
        CycleScheduler::new(
            orchestrator,
            fx.collaborators.users.clone(),
            jobs,
            SchedulerConfig::default(),
        )
    }

    fn mailbox() -> StubMail {
        StubMail::with_messages(vec![message("m1", "alice@work.com", "Hello", "Body text")])
    }

    #[tokio::test]
    async fn one_failing_user_does_not_stop_the_cycle() {
        let mail = mailbox();
        mail.fail_list_for.lock().unwrap().insert("b".into());
        let fx = Fixture::new(vec![profile("a", 5), profile("b", 5)], mail).await;
        let jobs = Arc::new(InMemoryJobLog::new());
        let scheduler = scheduler_with(&fx, jobs.clone());

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::CompletedWithErrors);
        assert_eq!(report.users_found, 2);
        assert_eq!(report.users_processed, 1);
        assert_eq!(report.total_errors, 1);
        assert_eq!(report.errors[0].user_id.as_deref(), Some("b"));
        assert_eq!(report.errors[0].kind, "provider_api");
        assert_eq!(report.total_processed, 1);
        assert_eq!(fx.accounts.balance("a").await.unwrap(), 4);

        let job = jobs
            .latest(JobType::EmailProcessingCycle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, report.job_id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.metadata["cycle_status"], "completed_with_errors");
        assert_eq!(scheduler.status(), CycleStatus::CompletedWithErrors);
    }

    #[tokio::test]
    async fn clean_cycle_completes() {
        let fx = Fixture::new(vec![profile("a", 5)], mailbox()).await;
        let jobs = Arc::new(InMemoryJobLog::new());
        let scheduler = scheduler_with(&fx, jobs.clone());

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::Completed);
        assert_eq!(report.total_discovered, 1);
        assert_eq!(report.total_credits_used, 1);

        let job = jobs.recent(1).await.unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn disabled_cycle_is_logged_and_does_nothing() {
        let fx = Fixture::new(vec![profile("a", 5)], mailbox()).await;
        let jobs = Arc::new(InMemoryJobLog::new());
        let scheduler = scheduler_with(&fx, jobs.clone());
        scheduler.set_enabled(false);

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::Disabled);
        assert_eq!(report.users_processed, 0);
        assert_eq!(fx.mail.list_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(jobs.recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_cycles_are_rejected() {
        let mail = mailbox();
        *mail.get_delay.lock().unwrap() = Some(Duration::from_millis(50));
        let fx = Fixture::new(vec![profile("a", 5)], mail).await;
        let scheduler = scheduler_with(&fx, Arc::new(InMemoryJobLog::new()));

        let (first, second) = tokio::join!(scheduler.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            scheduler.run_cycle().await
        });
        assert!(first.is_ok());
        assert!(matches!(second, Err(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn stale_records_are_swept_first() {
        let mut fx = Fixture::new(vec![], StubMail::default()).await;
        fx.messages.mark_discovered("a", "m1", None, 3).await.unwrap();
        fx.messages.mark_processing_started("a", "m1").await.unwrap();
        fx.config.processing_timeout_minutes = -1;
        let scheduler = scheduler_with(&fx, Arc::new(InMemoryJobLog::new()));

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.stale_reaped, 1);
        assert_eq!(report.users_found, 0);
        assert_eq!(report.status, CycleStatus::Completed);
    }

    #[tokio::test]
    async fn health_is_healthy_after_a_fresh_cycle() {
        let fx = Fixture::new(vec![profile("a", 5)], mailbox()).await;
        let scheduler = scheduler_with(&fx, Arc::new(InMemoryJobLog::new()));
        scheduler.run_cycle().await.unwrap();

        let health = scheduler.get_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.database.ok);
        assert!(health.last_cycle_at.is_some());
    }

    #[tokio::test]
    async fn broken_job_log_is_unhealthy() {
        let fx = Fixture::new(vec![], StubMail::default()).await;
        let scheduler = scheduler_with(&fx, Arc::new(BrokenJobLog));

        let health = scheduler.get_health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.database.ok);
        // A failing job log never fails the cycle itself.
        assert!(scheduler.run_cycle().await.is_ok());
    }

    #[tokio::test]
    async fn overdue_cycle_degrades_health() {
        let fx = Fixture::new(vec![], StubMail::default()).await;
        let jobs = Arc::new(InMemoryJobLog::new());
        let mut old = Job::new(JobType::EmailProcessingCycle);
        old.scheduled_for = Utc::now() - ChronoDuration::hours(2);
        jobs.create(&old).await.unwrap();
        let scheduler = scheduler_with(&fx, jobs);

        let health = scheduler.get_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.message.contains("overdue"));
    }

    #[tokio::test]
    async fn busy_queue_degrades_health() {
        let fx = Fixture::new(vec![], StubMail::default()).await;
        for i in 0..25 {
            fx.messages
                .mark_discovered("a", &format!("m{i}"), None, 3)
                .await
                .unwrap();
        }
        let scheduler = scheduler_with(&fx, Arc::new(InMemoryJobLog::new()));

        let health = scheduler.get_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.queue_status.unwrap().pending, 25);
    }
}
