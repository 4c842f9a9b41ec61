//! In-memory `MessageStore` and `JobLog`.
//!
//! Used by tests and by deployments that don't need records to survive a
//! restart. Every state change happens under one write lock, so the
//! transition checks are atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::json;
use tokio::sync::RwLock;

use crate::error::{DatabaseError, PipelineError};
use crate::scheduler::job::{Job, JobType};
use crate::store::traits::{
    JobLog, MessageRecord, MessageStatus, MessageStore, ProcessingStats, cutoff_before,
    not_discovered, retries_exhausted, transition_error,
};

type RecordKey = (String, String);

fn key(user_id: &str, message_id: &str) -> RecordKey {
    (user_id.to_string(), message_id.to_string())
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    records: RwLock<HashMap<RecordKey, MessageRecord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to an existing record under the write lock.
    async fn modify(
        &self,
        user_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut MessageRecord) -> Result<(), PipelineError>,
    ) -> Result<MessageRecord, PipelineError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&key(user_id, message_id))
            .ok_or_else(|| not_discovered(message_id))?;
        f(record)?;
        Ok(record.clone())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn mark_discovered(
        &self,
        user_id: &str,
        message_id: &str,
        filter_snapshot: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Result<MessageRecord, PipelineError> {
        let mut records = self.records.write().await;
        let record = records
            .entry(key(user_id, message_id))
            .and_modify(|r| {
                r.discovery_count += 1;
                r.discovered_at = Utc::now();
            })
            .or_insert_with(|| {
                let mut r = MessageRecord::new(user_id, message_id, max_retries);
                r.filter_snapshot = filter_snapshot;
                r
            });
        Ok(record.clone())
    }

    async fn mark_processing_started(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError> {
        self.modify(user_id, message_id, |r| {
            if !r.status.can_transition_to(MessageStatus::Processing) {
                return Err(transition_error(r, MessageStatus::Processing));
            }
            r.status = MessageStatus::Processing;
            r.processing_started_at = Some(Utc::now());
            r.processing_completed_at = None;
            r.attempt_count += 1;
            Ok(())
        })
        .await
    }

    async fn mark_processing_completed(
        &self,
        user_id: &str,
        message_id: &str,
        result: serde_json::Value,
        success: bool,
    ) -> Result<MessageRecord, PipelineError> {
        let target = if success {
            MessageStatus::Completed
        } else {
            MessageStatus::Failed
        };
        self.modify(user_id, message_id, |r| {
            if !r.status.can_transition_to(target) {
                return Err(transition_error(r, target));
            }
            r.status = target;
            r.processing_completed_at = Some(Utc::now());
            r.last_result = Some(result);
            r.success = Some(success);
            Ok(())
        })
        .await
    }

    async fn mark_for_retry(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError> {
        self.modify(user_id, message_id, |r| {
            if r.status != MessageStatus::Failed {
                return Err(transition_error(r, MessageStatus::Discovered));
            }
            if r.attempt_count >= r.max_retries {
                return Err(retries_exhausted(r));
            }
            r.status = MessageStatus::Discovered;
            r.processing_started_at = None;
            r.processing_completed_at = None;
            r.success = None;
            Ok(())
        })
        .await
    }

    async fn mark_processing_timeout(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError> {
        self.modify(user_id, message_id, |r| {
            if r.status != MessageStatus::Processing {
                return Err(transition_error(r, MessageStatus::Failed));
            }
            r.status = MessageStatus::Failed;
            r.processing_completed_at = Some(Utc::now());
            r.last_result = Some(json!({"error": "processing_timeout"}));
            r.success = Some(false);
            Ok(())
        })
        .await
    }

    async fn get_record(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, PipelineError> {
        let records = self.records.read().await;
        Ok(records.get(&key(user_id, message_id)).cloned())
    }

    async fn get_unprocessed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PipelineError> {
        let records = self.records.read().await;
        let mut pending: Vec<MessageRecord> = records
            .values()
            .filter(|r| r.user_id == user_id && r.status == MessageStatus::Discovered)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_processing_history(
        &self,
        user_id: &str,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PipelineError> {
        let records = self.records.read().await;
        let mut history: Vec<MessageRecord> = records
            .values()
            .filter(|r| r.user_id == user_id && r.status.is_finished())
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        history.sort_by(|a, b| b.processing_completed_at.cmp(&a.processing_completed_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn get_stats(&self, user_id: Option<&str>) -> Result<ProcessingStats, PipelineError> {
        let records = self.records.read().await;
        Ok(ProcessingStats::from_records(
            records
                .values()
                .filter(|r| user_id.is_none_or(|u| r.user_id == u)),
        ))
    }

    async fn get_stale(&self, minutes: i64) -> Result<Vec<MessageRecord>, PipelineError> {
        let cutoff = cutoff_before(TimeDelta::try_minutes(minutes), "stale age")?;
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| {
                r.status == MessageStatus::Processing
                    && r.processing_started_at.is_some_and(|t| t < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn get_duplicates(&self, user_id: &str) -> Result<Vec<MessageRecord>, PipelineError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.user_id == user_id && r.discovery_count > 1)
            .cloned()
            .collect())
    }

    async fn cleanup_old_records(&self, days: i64) -> Result<u64, PipelineError> {
        let cutoff = cutoff_before(TimeDelta::try_days(days), "retention period")?;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| {
            !(r.status.is_finished() && r.processing_completed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - records.len()) as u64)
    }

    async fn delete_user_data(&self, user_id: &str) -> Result<u64, PipelineError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|(u, _), _| u != user_id);
        Ok((before - records.len()) as u64)
    }
}

/// In-memory job log. Jobs are kept in insertion order.
#[derive(Default)]
pub struct InMemoryJobLog {
    jobs: RwLock<Vec<Job>>,
}

impl InMemoryJobLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLog for InMemoryJobLog {
    async fn create(&self, job: &Job) -> Result<(), DatabaseError> {
        let mut jobs = self.jobs.write().await;
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(DatabaseError::Constraint(format!("job {} already exists", job.id)));
        }
        jobs.push(job.clone());
        Ok(())
    }

    async fn latest(&self, job_type: JobType) -> Result<Option<Job>, DatabaseError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().rev().find(|j| j.job_type == job_type).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn discovered(store: &InMemoryMessageStore, id: &str) -> MessageRecord {
        store.mark_discovered("u1", id, None, 3).await.unwrap()
    }

    #[tokio::test]
    async fn rediscovery_bumps_count_without_duplicating() {
        let store = InMemoryMessageStore::new();
        let first = discovered(&store, "m1").await;
        let second = discovered(&store, "m1").await;

        assert_eq!(first.id, second.id);
        assert_eq!(second.discovery_count, 2);
        assert_eq!(second.status, MessageStatus::Discovered);
        assert!(second.discovered_at >= first.discovered_at);
        assert_eq!(store.get_stats(Some("u1")).await.unwrap().total_discovered, 1);
    }

    #[tokio::test]
    async fn rediscovery_keeps_finished_status() {
        let store = InMemoryMessageStore::new();
        discovered(&store, "m1").await;
        store.mark_processing_started("u1", "m1").await.unwrap();
        store
            .mark_processing_completed("u1", "m1", json!({}), true)
            .await
            .unwrap();
        let again = discovered(&store, "m1").await;
        assert_eq!(again.status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn processing_is_exclusive() {
        let store = InMemoryMessageStore::new();
        discovered(&store, "m1").await;
        let started = store.mark_processing_started("u1", "m1").await.unwrap();
        assert_eq!(started.status, MessageStatus::Processing);
        assert_eq!(started.attempt_count, 1);

        let err = store.mark_processing_started("u1", "m1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(ref m) if m.contains("already being processed")));
    }

    #[tokio::test]
    async fn unknown_message_cannot_start() {
        let store = InMemoryMessageStore::new();
        let err = store.mark_processing_started("u1", "nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn completion_requires_processing() {
        let store = InMemoryMessageStore::new();
        discovered(&store, "m1").await;
        assert!(
            store
                .mark_processing_completed("u1", "m1", json!({}), true)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn retry_is_bounded() {
        let store = InMemoryMessageStore::new();
        store.mark_discovered("u1", "m1", None, 2).await.unwrap();

        for _ in 0..2 {
            store.mark_processing_started("u1", "m1").await.unwrap();
            store
                .mark_processing_completed("u1", "m1", json!({"error": "boom"}), false)
                .await
                .unwrap();
            if store.get_record("u1", "m1").await.unwrap().unwrap().can_retry() {
                let r = store.mark_for_retry("u1", "m1").await.unwrap();
                assert_eq!(r.status, MessageStatus::Discovered);
            }
        }

        let err = store.mark_for_retry("u1", "m1").await.unwrap_err();
        assert!(err.to_string().contains("maximum retry attempts exceeded"));
        let record = store.get_record("u1", "m1").await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Failed);
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn timeout_fails_stuck_records() {
        let store = InMemoryMessageStore::new();
        discovered(&store, "m1").await;
        store.mark_processing_started("u1", "m1").await.unwrap();

        // Nothing is stale yet.
        assert!(store.get_stale(30).await.unwrap().is_empty());
        assert_eq!(store.get_stale(-1).await.unwrap().len(), 1);

        let r = store.mark_processing_timeout("u1", "m1").await.unwrap();
        assert_eq!(r.status, MessageStatus::Failed);
        assert_eq!(r.last_result, Some(json!({"error": "processing_timeout"})));
        assert!(store.mark_processing_timeout("u1", "m1").await.is_err());
    }

    #[tokio::test]
    async fn unprocessed_is_oldest_first_and_limited() {
        let store = InMemoryMessageStore::new();
        for id in ["m1", "m2", "m3"] {
            discovered(&store, id).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.mark_processing_started("u1", "m2").await.unwrap();

        let pending = store.get_unprocessed("u1", 5).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
        assert_eq!(store.get_unprocessed("u1", 1).await.unwrap().len(), 1);
        assert!(store.get_unprocessed("u2", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_filters_by_status() {
        let store = InMemoryMessageStore::new();
        for (id, ok) in [("m1", true), ("m2", false)] {
            discovered(&store, id).await;
            store.mark_processing_started("u1", id).await.unwrap();
            store
                .mark_processing_completed("u1", id, json!({}), ok)
                .await
                .unwrap();
        }
        discovered(&store, "m3").await;

        assert_eq!(
            store
                .get_processing_history("u1", None, 10)
                .await
                .unwrap()
                .len(),
            2
        );
        let failed = store
            .get_processing_history("u1", Some(MessageStatus::Failed), 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message_id, "m2");
    }

    #[tokio::test]
    async fn cleanup_and_delete() {
        let store = InMemoryMessageStore::new();
        discovered(&store, "m1").await;
        store.mark_processing_started("u1", "m1").await.unwrap();
        store
            .mark_processing_completed("u1", "m1", json!({}), true)
            .await
            .unwrap();
        discovered(&store, "m2").await;
        store.mark_discovered("u2", "x", None, 3).await.unwrap();

        assert_eq!(store.cleanup_old_records(1).await.unwrap(), 0);
        // Negative retention puts the cutoff in the future.
        assert_eq!(store.cleanup_old_records(-1).await.unwrap(), 1);
        assert!(matches!(
            store.cleanup_old_records(1_000_000_000).await,
            Err(PipelineError::Validation(_))
        ));
        assert!(store.get_stale(i64::MAX).await.is_err());
        assert_eq!(store.delete_user_data("u1").await.unwrap(), 1);
        assert!(store.get_record("u2", "x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicates_are_reported() {
        let store = InMemoryMessageStore::new();
        discovered(&store, "m1").await;
        discovered(&store, "m1").await;
        discovered(&store, "m2").await;
        let dups = store.get_duplicates("u1").await.unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].message_id, "m1");
    }

    #[tokio::test]
    async fn job_log_returns_latest() {
        let log = InMemoryJobLog::new();
        let first = Job::new(JobType::EmailProcessingCycle);
        let second = Job::new(JobType::EmailProcessingCycle);
        log.create(&first).await.unwrap();
        log.create(&second).await.unwrap();
        assert!(log.create(&second).await.is_err());

        let latest = log.latest(JobType::EmailProcessingCycle).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(log.recent(10).await.unwrap().len(), 2);
    }
}
