//! Discovery: find unseen provider messages and start tracking them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::filter::{self, FilterRules};
use crate::pipeline::types::{DiscoveryResult, FilteredMessage};
use crate::pipeline::{ACTION_DISCOVERY, Collaborators, Guards};
use crate::store::traits::UserProfile;

pub struct DiscoveryEngine {
    collaborators: Collaborators,
    guards: Guards,
    config: PipelineConfig,
}

impl DiscoveryEngine {
    pub fn new(collaborators: Collaborators, guards: Guards, config: PipelineConfig) -> Self {
        Self {
            collaborators,
            guards,
            config,
        }
    }

    /// Query the user's mailbox and record every new message that passes
    /// their filter rules (or every new message, with `apply_filters=false`).
    ///
    /// The provider breaker is judged once per call, not per message.
    pub async fn discover(
        &self,
        user_id: &str,
        apply_filters: bool,
    ) -> Result<DiscoveryResult, PipelineError> {
        if user_id.trim().is_empty() {
            return Err(PipelineError::validation("user id is required"));
        }

        let profile = self
            .collaborators
            .users
            .get_profile(user_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("user", user_id))?;

        let breaker = &self.guards.provider_breaker;
        breaker.check(user_id)?;
        if let Err(e) = self.guards.rate_limiter.enforce(user_id, ACTION_DISCOVERY) {
            breaker.release_trial(user_id);
            return Err(e);
        }

        match self.scan(&profile, apply_filters).await {
            Ok(result) => {
                breaker.record_success(user_id);
                info!(
                    user_id,
                    candidates = result.discovered_count,
                    new = result.new_messages,
                    filtered = result.filtered_count,
                    "Discovery complete"
                );
                Ok(result)
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
                warn!(user_id, error = %e, "Discovery failed");
                Err(e)
            }
        }
    }

    async fn scan(
        &self,
        profile: &UserProfile,
        apply_filters: bool,
    ) -> Result<DiscoveryResult, PipelineError> {
        let user_id = profile.user_id.as_str();
        let rules = &profile.filters;
        let query = filter::build_query(rules);
        debug!(user_id, query = %query, "Listing candidate messages");

        let mail = &self.collaborators.mail;
        let page_size = self.config.discovery_page_size;
        let candidates = self
            .guards
            .retry
            .run("list_candidate_ids", || {
                mail.list_candidate_ids(user_id, &query, page_size)
            })
            .await?;

        let store = &self.collaborators.messages;
        let mut result = DiscoveryResult {
            user_id: user_id.to_string(),
            discovered_count: candidates.len(),
            ..Default::default()
        };

        for message_id in &candidates {
            if store.get_record(user_id, message_id).await?.is_some() {
                store
                    .mark_discovered(user_id, message_id, None, self.config.max_retries)
                    .await?;
                result.rediscovered_count += 1;
                continue;
            }

            let message = self
                .guards
                .retry
                .run("get_message", || mail.get_message(user_id, message_id))
                .await?;

            if apply_filters {
                let verdict = filter::evaluate(&message, rules);
                if let Some(reason) = verdict.reason {
                    result.filtered_count += 1;
                    result.filtered.push(FilteredMessage {
                        message_id: message_id.clone(),
                        reason,
                    });
                    continue;
                }
            }

            store
                .mark_discovered(
                    user_id,
                    message_id,
                    filter_snapshot(rules, apply_filters),
                    self.config.max_retries,
                )
                .await?;
            result.new_messages += 1;
            result.new_message_ids.push(message_id.clone());
        }

        Ok(result)
    }
}

fn filter_snapshot(rules: &FilterRules, applied: bool) -> Option<serde_json::Value> {
    if !applied {
        return None;
    }
    serde_json::to_value(rules).ok()
}
