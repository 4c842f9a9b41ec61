//! Cycle job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet started.
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Failed once and scheduled to run again.
    Retrying,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) |
            (Running, Retrying) | (Running, Cancelled) |
            // From Retrying
            (Retrying, Running) | (Retrying, Failed) | (Retrying, Cancelled)
        )
    }

    /// Terminal jobs are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Kind of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// One pass of the pipeline over all eligible users.
    EmailProcessingCycle,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailProcessingCycle => "email_processing_cycle",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_processing_cycle" => Ok(Self::EmailProcessingCycle),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Audit record of one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub attempts: u32,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Cycle statistics.
    pub metadata: serde_json::Value,
    pub error: Option<String>,
}

impl Job {
    pub fn new(job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            attempts: 0,
            scheduled_for: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: serde_json::Value::Null,
            error: None,
        }
    }

    /// Move to `target`, stamping timestamps. Terminal jobs refuse every
    /// transition.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition job {} from {} to {}",
                self.id, self.status, target
            ));
        }

        self.status = target;
        match target {
            JobStatus::Running => {
                self.attempts += 1;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Seconds between start and completion.
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.completed_at?;
        Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
    }
}
