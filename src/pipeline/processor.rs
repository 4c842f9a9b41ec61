//! Processing engine: one tracked message from `discovered` to `completed`.
//!
//! Flow:
//! 1. Preconditions (record, profile, credits, bot switch)
//! 2. Provider breaker + rate limit
//! 3. `discovered → processing`
//! 4. Fetch → summarize → reply → mark read
//! 5. `processing → completed`, then debit
//!
//! Any error after step 3 leaves the record `failed`.

use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::types::ProcessOutcome;
use crate::pipeline::{ACTION_PROCESSING, Collaborators, Guards};
use crate::providers::{
    MailMessage, OutgoingReply, SUMMARY_SUBJECT_PREFIX, Summary, SummaryMetadata,
};
use crate::store::traits::{MessageStatus, UserProfile};

const REPLY_FOOTER: &str = "This summary was generated automatically by your AI email assistant.";

pub struct ProcessingEngine {
    collaborators: Collaborators,
    guards: Guards,
    config: PipelineConfig,
}

/// What the inner steps produced for a successful attempt.
struct Delivered {
    summary: Summary,
    reply_sent: bool,
}

impl ProcessingEngine {
    pub fn new(collaborators: Collaborators, guards: Guards, config: PipelineConfig) -> Self {
        Self {
            collaborators,
            guards,
            config,
        }
    }

    /// Process one discovered message for `user_id`.
    ///
    /// The `discovered → processing` transition is the claim: of two
    /// concurrent calls for the same message exactly one gets past it.
    pub async fn process(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        if user_id.trim().is_empty() || message_id.trim().is_empty() {
            return Err(PipelineError::validation(
                "user id and message id are required",
            ));
        }

        let store = &self.collaborators.messages;
        if let Some(record) = store.get_record(user_id, message_id).await?
            && record.status == MessageStatus::Completed
        {
            return Err(PipelineError::Validation(format!(
                "message {message_id}: already processed"
            )));
        }

        let profile = self.eligible_profile(user_id).await?;

        let breaker = &self.guards.provider_breaker;
        breaker.check(user_id)?;
        if let Err(e) = self.guards.rate_limiter.enforce(user_id, ACTION_PROCESSING) {
            breaker.release_trial(user_id);
            return Err(e);
        }

        if let Err(e) = store.mark_processing_started(user_id, message_id).await {
            breaker.release_trial(user_id);
            return Err(e);
        }

        let started = Instant::now();
        info!(user_id, message_id, "Processing message");

        let delivered = match self.deliver(&profile, message_id).await {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(user_id, message_id, error = %e, "Processing failed");
                let result = json!({
                    "error": e.to_string(),
                    "kind": e.kind(),
                });
                if let Err(store_err) = store
                    .mark_processing_completed(user_id, message_id, result, false)
                    .await
                {
                    warn!(user_id, message_id, error = %store_err, "Failed to record processing failure");
                }
                return Err(e);
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        let credits = self.config.credits_per_message;
        let result = json!({
            "summary": delivered.summary.summary,
            "keywords": delivered.summary.keywords,
            "action_items": delivered.summary.action_items,
            "reply_sent": delivered.reply_sent,
            "credits_used": credits,
            "processing_time_secs": elapsed,
        });
        store
            .mark_processing_completed(user_id, message_id, result, true)
            .await?;

        let balance = self
            .collaborators
            .ledger
            .debit(user_id, credits, &format!("Processed email {message_id}"))
            .await?;

        info!(
            user_id,
            message_id,
            reply_sent = delivered.reply_sent,
            balance,
            elapsed_secs = elapsed,
            "Message processed"
        );

        Ok(ProcessOutcome {
            message_id: message_id.to_string(),
            success: true,
            credits_used: credits,
            summary_sent: delivered.reply_sent,
            processing_time_secs: elapsed,
        })
    }

    /// Fail every record stuck in `processing` for longer than `minutes`.
    /// Returns the number of records reaped.
    pub async fn sweep_stale(&self, minutes: i64) -> Result<usize, PipelineError> {
        let store = &self.collaborators.messages;
        let stale = store.get_stale(minutes).await?;
        let mut reaped = 0;
        for record in &stale {
            match store
                .mark_processing_timeout(&record.user_id, &record.message_id)
                .await
            {
                Ok(_) => reaped += 1,
                // Finished by its worker between the query and now.
                Err(PipelineError::Validation(reason)) => {
                    debug!(message_id = %record.message_id, %reason, "Stale record already moved on");
                }
                Err(e) => return Err(e),
            }
        }
        if reaped > 0 {
            warn!(reaped, minutes, "Timed out stale processing records");
        }
        Ok(reaped)
    }

    async fn eligible_profile(&self, user_id: &str) -> Result<UserProfile, PipelineError> {
        let profile = self
            .collaborators
            .users
            .get_profile(user_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("user", user_id))?;

        if profile.credits_remaining <= 0 {
            return Err(PipelineError::InsufficientCredits {
                user_id: user_id.to_string(),
                balance: profile.credits_remaining,
                requested: self.config.credits_per_message,
            });
        }
        if !profile.bot_enabled {
            return Err(PipelineError::Validation(format!(
                "bot is disabled for user {user_id}"
            )));
        }
        Ok(profile)
    }

    async fn deliver(
        &self,
        profile: &UserProfile,
        message_id: &str,
    ) -> Result<Delivered, PipelineError> {
        let user_id = profile.user_id.as_str();
        let mail = &self.collaborators.mail;
        let breaker = &self.guards.provider_breaker;

        let fetched = self
            .guards
            .retry
            .run("get_message", || mail.get_message(user_id, message_id))
            .await;
        let message = match fetched {
            Ok(message) => {
                breaker.record_success(user_id);
                message
            }
            Err(e) => {
                if e.is_upstream_failure() {
                    breaker.record_failure(user_id);
                } else {
                    breaker.release_trial(user_id);
                }
                self.collaborators
                    .flag_rejected_credentials(user_id, &e)
                    .await;
                return Err(e);
            }
        };

        let summary = self.summarize(&message).await?;

        let reply = OutgoingReply {
            thread_id: message.thread_id.clone(),
            from: profile.email_address.clone(),
            to: message.sender.clone(),
            subject: reply_subject(&message.subject),
            in_reply_to: message.rfc822_message_id.clone(),
            body: compose_reply_body(&message, &summary),
        };
        let reply_sent = match mail.send_reply(user_id, &reply).await {
            Ok(sent) => {
                debug!(user_id, message_id, reply_id = %sent.id, "Summary reply sent");
                true
            }
            Err(e) => {
                warn!(user_id, message_id, error = %e, "Failed to send summary reply");
                self.collaborators
                    .flag_rejected_credentials(user_id, &e)
                    .await;
                false
            }
        };

        if let Err(e) = mail.mark_read(user_id, message_id).await {
            warn!(user_id, message_id, error = %e, "Failed to mark message read");
        }

        Ok(Delivered {
            summary,
            reply_sent,
        })
    }

    async fn summarize(&self, message: &MailMessage) -> Result<Summary, PipelineError> {
        let summarizer = &self.collaborators.summarizer;
        let metadata = SummaryMetadata::from(message);
        let retry = &self.guards.retry;
        self.guards
            .summarizer_breaker
            .call(summarizer.name(), || {
                retry.run("summarize", || summarizer.summarize(&message.body, &metadata))
            })
            .await
    }
}

fn reply_subject(subject: &str) -> String {
    format!("{SUMMARY_SUBJECT_PREFIX} {subject}")
}

/// Plain-text body of the summary reply.
pub fn compose_reply_body(message: &MailMessage, summary: &Summary) -> String {
    let mut body = format!(
        "{}\n\n{}\n",
        reply_subject(&message.subject),
        summary.summary.trim()
    );

    if !summary.keywords.is_empty() {
        body.push_str(&format!("\n🔑 Key Points: {}\n", summary.keywords.join(", ")));
    }

    if !summary.action_items.is_empty() {
        body.push_str("\n✅ Action Items:\n");
        for item in &summary.action_items {
            body.push_str(&format!("• {item}\n"));
        }
    }

    body.push_str("\n---\n");
    body.push_str(REPLY_FOOTER);
    body.push('\n');
    body
}
