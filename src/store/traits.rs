//! Store traits consumed by the pipeline.
//!
//! - [`MessageStore`]: per-message lifecycle records
//! - [`UserStore`]: read-only eligibility projection of user profiles
//! - [`CreditLedger`]: credit balance and debits
//! - [`JobLog`]: one audit record per scheduler cycle

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::filter::FilterRules;
use crate::scheduler::job::{Job, JobType};

/// Lifecycle of a tracked provider message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Tracked and waiting to be processed.
    Discovered,
    /// A worker holds it.
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        use MessageStatus::*;

        matches!(
            (self, target),
            (Discovered, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                // Retry
                | (Failed, Discovered)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Self::Discovered),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// One tracked (user, provider message) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub message_id: String,
    pub status: MessageStatus,
    pub discovery_count: u32,
    pub discovered_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_retries: u32,
    /// Free-form outcome payload of the last attempt.
    pub last_result: Option<serde_json::Value>,
    pub success: Option<bool>,
    /// Filter rules the message was accepted under.
    pub filter_snapshot: Option<serde_json::Value>,
}

impl MessageRecord {
    pub fn new(user_id: &str, message_id: &str, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            status: MessageStatus::Discovered,
            discovery_count: 1,
            discovered_at: Utc::now(),
            processing_started_at: None,
            processing_completed_at: None,
            attempt_count: 0,
            max_retries,
            last_result: None,
            success: None,
            filter_snapshot: None,
        }
    }

    /// Whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.status == MessageStatus::Failed && self.attempt_count < self.max_retries
    }

    /// Seconds spent in the last processing attempt.
    pub fn processing_secs(&self) -> Option<f64> {
        let started = self.processing_started_at?;
        let finished = self.processing_completed_at?;
        Some((finished - started).num_milliseconds().max(0) as f64 / 1000.0)
    }

    pub fn credits_used(&self) -> i64 {
        self.last_result
            .as_ref()
            .and_then(|r| r.get("credits_used"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

/// Aggregate counters over message records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub total_discovered: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub pending: u64,
    pub processing: u64,
    /// Percentage of processed messages that succeeded.
    pub success_rate: f64,
    pub credits_used: i64,
    pub avg_processing_time_secs: f64,
}

impl ProcessingStats {
    /// Fold a set of records into stats.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MessageRecord>) -> Self {
        let mut stats = Self::default();
        let mut total_secs = 0.0;
        let mut timed = 0u64;

        for r in records {
            stats.total_discovered += 1;
            match r.status {
                MessageStatus::Discovered => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Completed | MessageStatus::Failed => {
                    stats.processed += 1;
                    if r.success == Some(true) {
                        stats.successful += 1;
                        stats.credits_used += r.credits_used();
                    } else {
                        stats.failed += 1;
                    }
                    if let Some(secs) = r.processing_secs() {
                        total_secs += secs;
                        timed += 1;
                    }
                }
            }
        }

        if stats.processed > 0 {
            stats.success_rate = stats.successful as f64 / stats.processed as f64 * 100.0;
        }
        if timed > 0 {
            stats.avg_processing_time_secs = total_secs / timed as f64;
        }
        stats
    }
}

/// Per-message lifecycle store.
///
/// State-changing methods enforce the transition table in
/// [`MessageStatus::can_transition_to`] atomically and report violations as
/// `PipelineError::Validation`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    // ── Lifecycle ───────────────────────────────────────────────────

    /// Track a message, or bump the discovery count of a tracked one.
    async fn mark_discovered(
        &self,
        user_id: &str,
        message_id: &str,
        filter_snapshot: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Result<MessageRecord, PipelineError>;

    /// `discovered → processing`. Fails if the message is unknown or not
    /// currently `discovered`.
    async fn mark_processing_started(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError>;

    /// `processing → completed | failed`.
    async fn mark_processing_completed(
        &self,
        user_id: &str,
        message_id: &str,
        result: serde_json::Value,
        success: bool,
    ) -> Result<MessageRecord, PipelineError>;

    /// `failed → discovered`, refused once the retry cap is reached.
    async fn mark_for_retry(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError>;

    /// Force a stuck `processing` record to `failed` with `processing_timeout`.
    async fn mark_processing_timeout(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError>;

    // ── Queries ─────────────────────────────────────────────────────

    async fn get_record(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, PipelineError>;

    /// `discovered` records, oldest discovery first.
    async fn get_unprocessed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PipelineError>;

    /// Finished records, most recently completed first.
    async fn get_processing_history(
        &self,
        user_id: &str,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PipelineError>;

    /// Stats for one user, or across all users when `user_id` is `None`.
    async fn get_stats(&self, user_id: Option<&str>) -> Result<ProcessingStats, PipelineError>;

    /// `processing` records started more than `minutes` ago.
    async fn get_stale(&self, minutes: i64) -> Result<Vec<MessageRecord>, PipelineError>;

    /// Records discovered more than once.
    async fn get_duplicates(&self, user_id: &str) -> Result<Vec<MessageRecord>, PipelineError>;

    // ── Maintenance ─────────────────────────────────────────────────

    /// Delete finished records completed more than `days` ago.
    async fn cleanup_old_records(&self, days: i64) -> Result<u64, PipelineError>;

    async fn delete_user_data(&self, user_id: &str) -> Result<u64, PipelineError>;
}

/// Eligibility projection of a user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email_address: String,
    pub bot_enabled: bool,
    pub credits_remaining: i64,
    #[serde(default)]
    pub filters: FilterRules,
}

impl UserProfile {
    pub fn is_eligible(&self) -> bool {
        self.bot_enabled && self.credits_remaining > 0
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, PipelineError>;

    /// Users with the bot enabled and credits left, in a stable order.
    async fn list_eligible(&self) -> Result<Vec<UserProfile>, PipelineError>;
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, PipelineError>;

    /// Debit `amount` and return the new balance. Fails with
    /// `InsufficientCredits` when the balance is below `amount`.
    async fn debit(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<i64, PipelineError>;
}

/// Append-only audit log of scheduler cycles.
#[async_trait]
pub trait JobLog: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Most recently scheduled job of `job_type`.
    async fn latest(&self, job_type: JobType) -> Result<Option<Job>, DatabaseError>;

    /// Most recent jobs first.
    async fn recent(&self, limit: usize) -> Result<Vec<Job>, DatabaseError>;
}

/// Validation error for a refused lifecycle transition.
pub(crate) fn transition_error(record: &MessageRecord, target: MessageStatus) -> PipelineError {
    let reason = match (record.status, target) {
        (MessageStatus::Completed, MessageStatus::Processing) => "already processed".to_string(),
        (MessageStatus::Processing, MessageStatus::Processing) => {
            "already being processed".to_string()
        }
        (from, to) => format!("cannot move from {from} to {to}"),
    };
    PipelineError::Validation(format!("message {}: {reason}", record.message_id))
}

/// `now - age`, refusing ages that fall outside the representable range.
pub(crate) fn cutoff_before(
    age: Option<TimeDelta>,
    what: &str,
) -> Result<DateTime<Utc>, PipelineError> {
    age.and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| PipelineError::Validation(format!("{what} is out of range")))
}

pub(crate) fn not_discovered(message_id: &str) -> PipelineError {
    PipelineError::Validation(format!("message {message_id}: not discovered"))
}

pub(crate) fn retries_exhausted(record: &MessageRecord) -> PipelineError {
    PipelineError::Validation(format!(
        "message {}: maximum retry attempts exceeded ({}/{})",
        record.message_id, record.attempt_count, record.max_retries
    ))
}
