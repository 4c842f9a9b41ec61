//! Typed results for every pipeline operation.

use serde::Serialize;

use crate::error::PipelineError;
use crate::pipeline::filter::FilterReason;
use crate::store::traits::{MessageRecord, ProcessingStats};

// ── Errors inside aggregate results ─────────────────────────────────

/// A per-message failure recorded inside a batch or retry run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageFailure {
    pub message_id: String,
    pub kind: String,
    pub error: String,
}

impl MessageFailure {
    pub fn new(message_id: &str, err: &PipelineError) -> Self {
        Self {
            message_id: message_id.to_string(),
            kind: err.kind().to_string(),
            error: err.to_string(),
        }
    }
}

/// A per-user failure recorded inside a cycle or bulk run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserFailure {
    pub user_id: Option<String>,
    pub kind: String,
    pub error: String,
}

impl UserFailure {
    pub fn new(user_id: Option<&str>, err: &PipelineError) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            kind: err.kind().to_string(),
            error: err.to_string(),
        }
    }
}

// ── Discovery ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredMessage {
    pub message_id: String,
    pub reason: FilterReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryResult {
    pub user_id: String,
    /// Candidate ids returned by the provider.
    pub discovered_count: usize,
    /// Newly tracked messages.
    pub new_messages: usize,
    pub new_message_ids: Vec<String>,
    /// Candidates that were already tracked.
    pub rediscovered_count: usize,
    pub filtered_count: usize,
    pub filtered: Vec<FilteredMessage>,
}

// ── Processing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub message_id: String,
    pub success: bool,
    pub credits_used: i64,
    pub summary_sent: bool,
    pub processing_time_secs: f64,
}

// ── Batch ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every pulled record was attempted.
    Completed,
    /// Nothing was waiting.
    NoMessages,
    /// The user ran out of credits mid-batch.
    InsufficientCredits,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NoMessages => "no_messages",
            Self::InsufficientCredits => "insufficient_credits",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub user_id: String,
    pub emails_processed: usize,
    pub credits_used: i64,
    pub failed_emails: usize,
    pub errors: Vec<MessageFailure>,
    pub stop_reason: StopReason,
}

impl BatchResult {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            emails_processed: 0,
            credits_used: 0,
            failed_emails: 0,
            errors: Vec::new(),
            stop_reason: StopReason::NoMessages,
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub user_id: String,
    pub discovery: DiscoveryResult,
    /// `None` when discovery found nothing new and the batch was skipped.
    pub batch: Option<BatchResult>,
}

impl PipelineResult {
    pub fn emails_processed(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.emails_processed)
    }

    pub fn credits_used(&self) -> i64 {
        self.batch.as_ref().map_or(0, |b| b.credits_used)
    }

    pub fn failed_emails(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.failed_emails)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryResult {
    pub user_id: String,
    pub successful_retries: usize,
    pub failed_retries: usize,
    /// Failed records already at their retry cap.
    pub skipped_max_retries: usize,
    pub errors: Vec<MessageFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkResult {
    pub total_users: usize,
    pub successful_users: usize,
    pub failed_users: usize,
    pub total_emails_processed: usize,
    pub total_credits_used: i64,
    /// Percentage of users whose run succeeded.
    pub success_rate: f64,
    pub errors: Vec<UserFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy,
    Degraded,
    Overloaded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub health: QueueHealth,
    pub pending: u64,
    pub processing: u64,
    pub avg_processing_time_secs: f64,
}

impl QueueStatus {
    /// Classify queue depth and latency.
    pub fn from_stats(stats: &ProcessingStats) -> Self {
        let pending = stats.pending;
        let avg = stats.avg_processing_time_secs;
        let health = if pending > 50 || avg > 10.0 {
            QueueHealth::Overloaded
        } else if pending > 20 || avg > 5.0 {
            QueueHealth::Degraded
        } else {
            QueueHealth::Healthy
        };
        Self {
            health,
            pending,
            processing: stats.processing,
            avg_processing_time_secs: avg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStatistics {
    pub user_id: String,
    pub credits_remaining: i64,
    pub bot_enabled: bool,
    pub stats: ProcessingStats,
    pub recent: Vec<MessageRecord>,
}
