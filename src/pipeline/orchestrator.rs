//! Pipeline orchestrator.
//!
//! Composes discovery, batch processing and maintenance into the
//! operations the scheduler and the ops API call.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::batch::BatchCoordinator;
use crate::pipeline::discovery::DiscoveryEngine;
use crate::pipeline::processor::ProcessingEngine;
use crate::pipeline::types::{
    BatchResult, BulkResult, DiscoveryResult, MessageFailure, PipelineResult, ProcessOutcome,
    QueueStatus, RetryResult, UserFailure, UserStatistics,
};
use crate::pipeline::{Collaborators, Guards};
use crate::store::traits::{MessageRecord, MessageStatus, UserProfile};

/// Records returned alongside user statistics.
const RECENT_HISTORY: usize = 10;

pub struct PipelineOrchestrator {
    collaborators: Collaborators,
    config: PipelineConfig,
    discovery: DiscoveryEngine,
    engine: Arc<ProcessingEngine>,
    batches: BatchCoordinator,
}

impl PipelineOrchestrator {
    pub fn new(collaborators: Collaborators, guards: Guards, config: PipelineConfig) -> Self {
        let discovery =
            DiscoveryEngine::new(collaborators.clone(), guards.clone(), config.clone());
        let engine = Arc::new(ProcessingEngine::new(
            collaborators.clone(),
            guards,
            config.clone(),
        ));
        let batches = BatchCoordinator::new(Arc::clone(&engine), collaborators.messages.clone());
        Self {
            collaborators,
            config,
            discovery,
            engine,
            batches,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn ensure_enabled(&self) -> Result<(), PipelineError> {
        if self.config.gmail_processing_enabled {
            Ok(())
        } else {
            Err(PipelineError::validation("gmail processing is disabled"))
        }
    }

    async fn require_profile(&self, user_id: &str) -> Result<UserProfile, PipelineError> {
        self.collaborators
            .users
            .get_profile(user_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("user", user_id))
    }

    // ── Core operations ─────────────────────────────────────────────

    pub async fn discover(
        &self,
        user_id: &str,
        apply_filters: bool,
    ) -> Result<DiscoveryResult, PipelineError> {
        self.ensure_enabled()?;
        self.discovery.discover(user_id, apply_filters).await
    }

    pub async fn process_one(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        self.ensure_enabled()?;
        self.engine.process(user_id, message_id).await
    }

    pub async fn run_batch(
        &self,
        user_id: &str,
        max_messages: usize,
    ) -> Result<BatchResult, PipelineError> {
        self.ensure_enabled()?;
        self.require_profile(user_id).await?;
        self.batches.run_batch(user_id, max_messages).await
    }

    /// Discover, then run a batch only when something new turned up.
    pub async fn run_full_pipeline(&self, user_id: &str) -> Result<PipelineResult, PipelineError> {
        let discovery = self.discover(user_id, true).await?;

        let batch = if discovery.new_messages > 0 {
            Some(self.run_batch(user_id, self.config.batch_size).await?)
        } else {
            None
        };

        let result = PipelineResult {
            user_id: user_id.to_string(),
            discovery,
            batch,
        };
        info!(
            user_id,
            discovered = result.discovery.new_messages,
            processed = result.emails_processed(),
            credits = result.credits_used(),
            "Pipeline run complete"
        );
        Ok(result)
    }

    /// Re-queue and process failed records still under their retry cap.
    ///
    /// `max_retries` tightens each record's own cap; it never loosens it.
    pub async fn retry_failed(
        &self,
        user_id: &str,
        max_retries: u32,
    ) -> Result<RetryResult, PipelineError> {
        self.ensure_enabled()?;
        self.require_profile(user_id).await?;

        let failed = self
            .collaborators
            .messages
            .get_processing_history(user_id, Some(MessageStatus::Failed), usize::MAX)
            .await?;

        let mut result = RetryResult {
            user_id: user_id.to_string(),
            ..Default::default()
        };

        for record in &failed {
            let cap = record.max_retries.min(max_retries);
            if record.attempt_count >= cap {
                result.skipped_max_retries += 1;
                continue;
            }

            let attempt = async {
                self.collaborators
                    .messages
                    .mark_for_retry(user_id, &record.message_id)
                    .await?;
                self.engine.process(user_id, &record.message_id).await
            };
            match attempt.await {
                Ok(_) => result.successful_retries += 1,
                Err(e) => {
                    result.failed_retries += 1;
                    result.errors.push(MessageFailure::new(&record.message_id, &e));
                }
            }
        }

        info!(
            user_id,
            succeeded = result.successful_retries,
            failed = result.failed_retries,
            skipped = result.skipped_max_retries,
            "Retry pass complete"
        );
        Ok(result)
    }

    /// Run the full pipeline for many users with bounded concurrency.
    pub async fn bulk_process_users(&self, user_ids: &[String]) -> BulkResult {
        let concurrency = self.config.bulk_concurrency.max(1);
        let outcomes: Vec<_> = stream::iter(user_ids)
            .map(|user_id| async move { (user_id, self.run_full_pipeline(user_id).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut result = BulkResult {
            total_users: user_ids.len(),
            ..Default::default()
        };
        for (user_id, outcome) in outcomes {
            match outcome {
                Ok(run) => {
                    result.successful_users += 1;
                    result.total_emails_processed += run.emails_processed();
                    result.total_credits_used += run.credits_used();
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Bulk run failed for user");
                    result.failed_users += 1;
                    result.errors.push(UserFailure::new(Some(user_id.as_str()), &e));
                }
            }
        }
        if result.total_users > 0 {
            result.success_rate =
                result.successful_users as f64 / result.total_users as f64 * 100.0;
        }
        result
    }

    // ── Reporting ───────────────────────────────────────────────────

    pub async fn get_user_statistics(
        &self,
        user_id: &str,
    ) -> Result<UserStatistics, PipelineError> {
        let profile = self.require_profile(user_id).await?;
        let messages = &self.collaborators.messages;
        let stats = messages.get_stats(Some(user_id)).await?;
        let recent = messages
            .get_processing_history(user_id, None, RECENT_HISTORY)
            .await?;
        Ok(UserStatistics {
            user_id: user_id.to_string(),
            credits_remaining: profile.credits_remaining,
            bot_enabled: profile.bot_enabled,
            stats,
            recent,
        })
    }

    pub async fn get_processing_history(
        &self,
        user_id: &str,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PipelineError> {
        self.require_profile(user_id).await?;
        self.collaborators
            .messages
            .get_processing_history(user_id, status, limit)
            .await
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus, PipelineError> {
        let stats = self.collaborators.messages.get_stats(None).await?;
        Ok(QueueStatus::from_stats(&stats))
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Fail records stuck in `processing` for longer than `minutes`
    /// (the configured timeout when `None`).
    pub async fn cleanup_stale_processing(
        &self,
        minutes: Option<i64>,
    ) -> Result<usize, PipelineError> {
        let minutes = minutes.unwrap_or(self.config.processing_timeout_minutes);
        self.engine.sweep_stale(minutes).await
    }

    pub async fn cleanup_old_records(&self, days: i64) -> Result<u64, PipelineError> {
        if days < 0 {
            return Err(PipelineError::validation("days cannot be negative"));
        }
        let removed = self.collaborators.messages.cleanup_old_records(days).await?;
        info!(days, removed, "Old message records cleaned up");
        Ok(removed)
    }

    pub async fn delete_user_data(&self, user_id: &str) -> Result<u64, PipelineError> {
        if user_id.trim().is_empty() {
            return Err(PipelineError::validation("user id is required"));
        }
        let removed = self.collaborators.messages.delete_user_data(user_id).await?;
        info!(user_id, removed, "User message data deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::pipeline::types::{QueueHealth, StopReason};
    use crate::store::traits::{CreditLedger, MessageStore};
    use crate::test_support::{Fixture, StubMail, message, profile};

    fn orchestrator(fx: &Fixture) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            fx.collaborators.clone(),
            fx.guards.clone(),
            fx.config.clone(),
        )
    }

    fn mailbox(ids: &[&str]) -> StubMail {
        StubMail::with_messages(
            ids.iter()
                .map(|id| message(id, "alice@work.com", &format!("About {id}"), "Some body text"))
                .collect(),
        )
    }

    #[tokio::test]
    async fn full_pipeline_discovers_and_processes() {
        let fx = Fixture::new(vec![profile("u1", 10)], mailbox(&["m1", "m2"])).await;
        let result = orchestrator(&fx).run_full_pipeline("u1").await.unwrap();

        assert_eq!(result.discovery.new_messages, 2);
        assert_eq!(result.emails_processed(), 2);
        assert_eq!(result.credits_used(), 2);
        assert_eq!(fx.accounts.balance("u1").await.unwrap(), 8);
        assert_eq!(fx.mail.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn full_pipeline_skips_batch_when_nothing_is_new() {
        let fx = Fixture::new(vec![profile("u1", 10)], StubMail::default()).await;
        let result = orchestrator(&fx).run_full_pipeline("u1").await.unwrap();
        assert!(result.batch.is_none());
        assert_eq!(fx.summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_processing_is_refused() {
        let mut fx = Fixture::new(vec![profile("u1", 10)], mailbox(&["m1"])).await;
        fx.config.gmail_processing_enabled = false;
        let err = orchestrator(&fx).run_full_pipeline("u1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(fx.mail.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_failed_reprocesses_under_cap_and_skips_exhausted() {
        let fx = Fixture::new(vec![profile("u1", 10)], mailbox(&["m1", "m2"])).await;
        fx.summarizer.fail.store(true, Ordering::SeqCst);
        let orch = orchestrator(&fx);

        let first = orch.run_full_pipeline("u1").await.unwrap();
        assert_eq!(first.failed_emails(), 2);

        // Exhaust m2's cap.
        for _ in 0..2 {
            fx.messages.mark_for_retry("u1", "m2").await.unwrap();
            fx.messages.mark_processing_started("u1", "m2").await.unwrap();
            fx.messages
                .mark_processing_completed("u1", "m2", serde_json::json!({"error": "x"}), false)
                .await
                .unwrap();
        }

        fx.summarizer.fail.store(false, Ordering::SeqCst);
        let result = orch.retry_failed("u1", 5).await.unwrap();
        assert_eq!(result.successful_retries, 1);
        assert_eq!(result.failed_retries, 0);
        assert_eq!(result.skipped_max_retries, 1);

        let m1 = fx.messages.get_record("u1", "m1").await.unwrap().unwrap();
        assert_eq!(m1.status, MessageStatus::Completed);
        assert_eq!(m1.attempt_count, 2);
    }

    #[tokio::test]
    async fn retry_cap_argument_only_tightens() {
        let fx = Fixture::new(vec![profile("u1", 10)], mailbox(&["m1"])).await;
        fx.summarizer.fail.store(true, Ordering::SeqCst);
        let orch = orchestrator(&fx);
        orch.run_full_pipeline("u1").await.unwrap();

        let result = orch.retry_failed("u1", 1).await.unwrap();
        assert_eq!(result.skipped_max_retries, 1);
        assert_eq!(result.successful_retries + result.failed_retries, 0);
    }

    #[tokio::test]
    async fn bulk_run_tallies_users() {
        let fx = Fixture::new(
            vec![profile("u1", 10), profile("u2", 10)],
            mailbox(&["m1"]),
        )
        .await;
        let users = vec!["u1".to_string(), "u2".to_string(), "ghost".to_string()];

        let result = orchestrator(&fx).bulk_process_users(&users).await;
        assert_eq!(result.total_users, 3);
        assert_eq!(result.successful_users, 2);
        assert_eq!(result.failed_users, 1);
        assert_eq!(result.errors[0].user_id.as_deref(), Some("ghost"));
        assert_eq!(result.errors[0].kind, "not_found");
        assert_eq!(result.total_emails_processed, 2);
        assert!((result.success_rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn statistics_and_history() {
        let fx = Fixture::new(vec![profile("u1", 10)], mailbox(&["m1"])).await;
        let orch = orchestrator(&fx);
        orch.run_full_pipeline("u1").await.unwrap();

        let stats = orch.get_user_statistics("u1").await.unwrap();
        assert_eq!(stats.credits_remaining, 9);
        assert_eq!(stats.stats.successful, 1);
        assert_eq!(stats.recent.len(), 1);

        let history = orch
            .get_processing_history("u1", Some(MessageStatus::Failed), 10)
            .await
            .unwrap();
        assert!(history.is_empty());

        assert!(matches!(
            orch.get_user_statistics("ghost").await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn queue_status_reflects_pending_work() {
        let fx = Fixture::new(vec![profile("u1", 10)], StubMail::default()).await;
        for i in 0..21 {
            fx.messages
                .mark_discovered("u1", &format!("m{i}"), None, 3)
                .await
                .unwrap();
        }
        let status = orchestrator(&fx).get_queue_status().await.unwrap();
        assert_eq!(status.pending, 21);
        assert_eq!(status.health, QueueHealth::Degraded);
    }

    #[tokio::test]
    async fn run_batch_requires_known_user() {
        let fx = Fixture::new(vec![profile("u1", 10)], StubMail::default()).await;
        let orch = orchestrator(&fx);
        assert!(matches!(
            orch.run_batch("ghost", 5).await,
            Err(PipelineError::NotFound { .. })
        ));
        let empty = orch.run_batch("u1", 5).await.unwrap();
        assert_eq!(empty.stop_reason, StopReason::NoMessages);
    }

    #[tokio::test]
    async fn maintenance_operations() {
        let fx = Fixture::new(vec![profile("u1", 10)], mailbox(&["m1"])).await;
        let orch = orchestrator(&fx);
        orch.run_full_pipeline("u1").await.unwrap();
        fx.messages.mark_discovered("u1", "m9", None, 3).await.unwrap();
        fx.messages.mark_processing_started("u1", "m9").await.unwrap();

        assert_eq!(orch.cleanup_stale_processing(Some(-1)).await.unwrap(), 1);
        assert!(orch.cleanup_old_records(-1).await.is_err());
        assert!(matches!(
            orch.cleanup_old_records(1_000_000_000).await,
            Err(PipelineError::Validation(_))
        ));
        assert_eq!(orch.cleanup_old_records(30).await.unwrap(), 0);
        assert_eq!(orch.delete_user_data("u1").await.unwrap(), 2);
        assert!(fx.messages.get_record("u1", "m1").await.unwrap().is_none());
    }
}
