//! Per-user batch runs with single-flight admission.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::pipeline::processor::ProcessingEngine;
use crate::pipeline::types::{BatchResult, MessageFailure, StopReason};
use crate::store::traits::MessageStore;

/// Set of keys with a run in progress. Concurrent callers for a busy key
/// are turned away, not queued.
#[derive(Clone, Default)]
pub struct SingleFlight {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. `None` when another run holds it.
    pub fn try_begin(&self, key: &str) -> Option<FlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(FlightGuard {
            key: key.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

/// Releases its key on drop, including on early return or panic.
pub struct FlightGuard {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

pub struct BatchCoordinator {
    engine: Arc<ProcessingEngine>,
    messages: Arc<dyn MessageStore>,
    flights: SingleFlight,
}

impl BatchCoordinator {
    pub fn new(engine: Arc<ProcessingEngine>, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            engine,
            messages,
            flights: SingleFlight::new(),
        }
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.flights.is_busy(user_id)
    }

    /// Process up to `max_messages` discovered records for `user_id`,
    /// oldest first, one at a time.
    ///
    /// Per-message errors are collected and the batch moves on. Running
    /// out of credits stops it.
    pub async fn run_batch(
        &self,
        user_id: &str,
        max_messages: usize,
    ) -> Result<BatchResult, PipelineError> {
        let Some(_guard) = self.flights.try_begin(user_id) else {
            return Err(PipelineError::Validation(format!(
                "processing already in progress for user {user_id}"
            )));
        };

        let pending = self.messages.get_unprocessed(user_id, max_messages).await?;
        let mut result = BatchResult::empty(user_id);
        if pending.is_empty() {
            return Ok(result);
        }
        result.stop_reason = StopReason::Completed;

        for record in &pending {
            match self.engine.process(user_id, &record.message_id).await {
                Ok(outcome) => {
                    result.emails_processed += 1;
                    result.credits_used += outcome.credits_used;
                }
                Err(e @ PipelineError::InsufficientCredits { .. }) => {
                    warn!(user_id, message_id = %record.message_id, "Out of credits, stopping batch");
                    result.errors.push(MessageFailure::new(&record.message_id, &e));
                    result.stop_reason = StopReason::InsufficientCredits;
                    break;
                }
                Err(e) => {
                    result.failed_emails += 1;
                    result.errors.push(MessageFailure::new(&record.message_id, &e));
                }
            }
        }

        info!(
            user_id,
            processed = result.emails_processed,
            failed = result.failed_emails,
            credits = result.credits_used,
            stop = result.stop_reason.label(),
            "Batch finished"
        );
        Ok(result)
    }
}
