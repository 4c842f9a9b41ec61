//! External API seams: the mail provider and the AI summarizer.
//!
//! The pipeline only talks to these traits. [`gmail::GmailClient`] and
//! [`anthropic::AnthropicSummarizer`] are the production implementations.

pub mod anthropic;
pub mod gmail;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Message bodies longer than this are cut before summarization.
pub const MAX_CONTENT_CHARS: usize = 5000;

/// Subject prefix on every summary reply. Discovery excludes it so the
/// pipeline never summarizes its own output.
pub const SUMMARY_SUBJECT_PREFIX: &str = "🤖 AI Summary:";

/// A fully fetched provider message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: String,
    /// Bare sender address, lowercased.
    pub sender: String,
    /// Display name from the From header, if any.
    pub sender_name: Option<String>,
    pub subject: String,
    /// Plain-text body, truncated to [`MAX_CONTENT_CHARS`].
    pub body: String,
    /// RFC 5322 Message-ID, used for reply threading.
    pub rfc822_message_id: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl MailMessage {
    /// Domain part of the sender address.
    pub fn sender_domain(&self) -> Option<&str> {
        self.sender.rsplit_once('@').map(|(_, domain)| domain)
    }
}

/// A reply ready to be handed to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingReply {
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub in_reply_to: Option<String>,
    pub body: String,
}

/// Provider acknowledgement of a sent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentReply {
    pub id: String,
    pub thread_id: Option<String>,
}

/// Context passed to the summarizer alongside the body.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryMetadata {
    pub subject: String,
    pub sender: String,
    pub received_at: Option<DateTime<Utc>>,
}

impl From<&MailMessage> for SummaryMetadata {
    fn from(message: &MailMessage) -> Self {
        Self {
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            received_at: message.received_at,
        }
    }
}

/// Summarizer output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
}

/// Per-user mailbox access.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Ids of messages matching `query`, newest first, at most `max_results`.
    async fn list_candidate_ids(
        &self,
        user_id: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<String>, PipelineError>;

    async fn get_message(&self, user_id: &str, message_id: &str)
    -> Result<MailMessage, PipelineError>;

    async fn send_reply(
        &self,
        user_id: &str,
        reply: &OutgoingReply,
    ) -> Result<SentReply, PipelineError>;

    async fn mark_read(&self, user_id: &str, message_id: &str) -> Result<(), PipelineError>;
}

/// AI summarization backend.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(
        &self,
        content: &str,
        metadata: &SummaryMetadata,
    ) -> Result<Summary, PipelineError>;
}

/// Supplies OAuth access tokens for a user's mailbox connection.
///
/// Token exchange and refresh live elsewhere; a missing connection is
/// `NotFound` and one flagged as broken is `Authentication`.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, user_id: &str) -> Result<SecretString, PipelineError>;

    /// Flag the connection as broken after the provider rejected its
    /// credentials. It stays in error until a new token is stored.
    async fn mark_connection_error(&self, user_id: &str, reason: &str)
    -> Result<(), PipelineError>;
}

/// Truncate `text` to [`MAX_CONTENT_CHARS`] characters, marking the cut.
pub fn truncate_content(text: &str) -> String {
    if text.chars().count() <= MAX_CONTENT_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_CONTENT_CHARS - 3).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_is_untouched() {
        assert_eq!(truncate_content("hello"), "hello");
    }

    #[test]
    fn long_content_is_cut_to_limit() {
        let long = "a".repeat(MAX_CONTENT_CHARS + 10);
        let out = truncate_content(&long);
        assert_eq!(out.chars().count(), MAX_CONTENT_CHARS);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_CONTENT_CHARS + 1);
        let out = truncate_content(&long);
        assert_eq!(out.chars().count(), MAX_CONTENT_CHARS);
    }

    #[test]
    fn sender_domain_splits_on_last_at() {
        let msg = MailMessage {
            id: "m1".into(),
            thread_id: "t1".into(),
            sender: "user@spam.com".into(),
            sender_name: None,
            subject: String::new(),
            body: String::new(),
            rfc822_message_id: None,
            received_at: None,
        };
        assert_eq!(msg.sender_domain(), Some("spam.com"));
    }
}
