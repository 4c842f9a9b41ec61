//! Background cycle ticker.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::ConfigError;
use crate::scheduler::cycle::CycleScheduler;

/// When cycles fire.
#[derive(Debug, Clone)]
pub enum CycleSchedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl CycleSchedule {
    /// A cron expression wins over the interval when both are set.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        match &config.cron {
            Some(expr) => {
                let schedule =
                    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
                        key: "MAILPILOT_CYCLE_CRON".to_string(),
                        message: format!("invalid cron: {e}"),
                    })?;
                Ok(Self::Cron(Box::new(schedule)))
            }
            None if config.interval.is_zero() => Err(ConfigError::InvalidValue {
                key: "MAILPILOT_CYCLE_INTERVAL_SECS".to_string(),
                message: "interval must be positive".to_string(),
            }),
            None => Ok(Self::Every(config.interval)),
        }
    }

    /// Next fire time strictly after `now`, if any.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .map(|step| now + step),
            Self::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

/// Spawn a background task that runs a cycle on every tick.
///
/// Interval schedules fire immediately and then every interval; cron
/// schedules wait for the next matching time. Returns a `JoinHandle` and
/// shutdown flag.
pub fn spawn_cycle_ticker(
    scheduler: Arc<CycleScheduler>,
    schedule: CycleSchedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        match schedule {
            CycleSchedule::Every(interval) => {
                info!("Cycle ticker started, running every {}s", interval.as_secs());
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        info!("Cycle ticker shutting down");
                        return;
                    }
                    run_once(&scheduler).await;
                }
            }
            CycleSchedule::Cron(cron) => {
                info!("Cycle ticker started on cron schedule");
                let schedule = CycleSchedule::Cron(cron);
                loop {
                    let now = Utc::now();
                    let Some(next) = schedule.next_fire(now) else {
                        warn!("Cron schedule has no upcoming fire time, stopping ticker");
                        return;
                    };
                    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    if shutdown.load(Ordering::Relaxed) {
                        info!("Cycle ticker shutting down");
                        return;
                    }
                    run_once(&scheduler).await;
                }
            }
        }
    });

    (handle, shutdown_flag)
}

async fn run_once(scheduler: &CycleScheduler) {
    match scheduler.run_cycle().await {
        Ok(report) => info!(
            status = %report.status,
            processed = report.total_processed,
            errors = report.total_errors,
            "Scheduled cycle done"
        ),
        Err(e) => warn!(error = %e, "Scheduled cycle not run"),
    }
}
