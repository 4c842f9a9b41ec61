//! Gmail v1 REST client.
//!
//! Every call authenticates with the user's bearer token from a
//! [`TokenSource`]. Status mapping:
//! - 403 with a rate or quota reason → `ProviderApi` 429 (retryable)
//! - 401/403 → `Authentication`
//! - 404 → `NotFound`
//! - anything else non-2xx → `ProviderApi` (429 and 5xx are retryable)

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use lettre::Message;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use regex::Regex;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::GmailConfig;
use crate::error::{ConfigError, PipelineError};
use crate::providers::{
    MailMessage, MailProvider, OutgoingReply, SentReply, TokenSource, truncate_content,
};

const PROVIDER: &str = "gmail";

static HTML_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]+>").ok());

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: String,
    /// Epoch milliseconds, as a string.
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    raw: String,
    thread_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

/// Google API error body. Throttling arrives as 403 with a rate or quota
/// reason, so the reasons decide between auth and backoff.
#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorDetail>,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ErrorReason {
    #[serde(default)]
    reason: String,
}

// ── Client ──────────────────────────────────────────────────────────

pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl GmailClient {
    pub fn new(config: &GmailConfig, tokens: Arc<dyn TokenSource>) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::ParseError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Point the client at another host (mock servers in tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.base_url)
    }

    async fn send_authed(
        &self,
        user_id: &str,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<reqwest::Response, PipelineError> {
        let token = self.tokens.access_token(user_id).await?;
        let response = request
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| PipelineError::provider(PROVIDER, format!("HTTP request failed: {e}")))?;

        let status = response.status();
        debug!(user_id, status = %status, resource, "Gmail response");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            403 if is_throttled(&body) => PipelineError::ProviderApi {
                provider: PROVIDER.to_string(),
                status: Some(429),
                reason: format!("{status} (rate limited): {body}"),
            },
            401 | 403 => PipelineError::Authentication {
                provider: PROVIDER.to_string(),
                reason: format!("{status} for user {user_id}"),
            },
            404 => PipelineError::not_found("gmail resource", resource),
            code => PipelineError::ProviderApi {
                provider: PROVIDER.to_string(),
                status: Some(code),
                reason: format!("{status}: {body}"),
            },
        })
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_candidate_ids(
        &self,
        user_id: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<String>, PipelineError> {
        let max = max_results.to_string();
        let request = self
            .http
            .get(self.url("messages"))
            .query(&[("q", query), ("maxResults", max.as_str())]);
        let response = self.send_authed(user_id, request, "messages").await?;
        let list: ListResponse = response.json().await.map_err(|e| {
            PipelineError::provider(PROVIDER, format!("failed to parse message list: {e}"))
        })?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get_message(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MailMessage, PipelineError> {
        let request = self
            .http
            .get(self.url(&format!("messages/{message_id}")))
            .query(&[("format", "full")]);
        let response = self.send_authed(user_id, request, message_id).await?;
        let raw: GmailMessage = response.json().await.map_err(|e| {
            PipelineError::provider(PROVIDER, format!("failed to parse message {message_id}: {e}"))
        })?;
        Ok(to_mail_message(raw))
    }

    async fn send_reply(
        &self,
        user_id: &str,
        reply: &OutgoingReply,
    ) -> Result<SentReply, PipelineError> {
        let raw = URL_SAFE_NO_PAD.encode(build_reply(reply)?.formatted());
        let request = self.http.post(self.url("messages/send")).json(&SendRequest {
            raw,
            thread_id: &reply.thread_id,
        });
        let response = self.send_authed(user_id, request, "messages/send").await?;
        let sent: SendResponse = response.json().await.map_err(|e| {
            PipelineError::provider(PROVIDER, format!("failed to parse send response: {e}"))
        })?;
        Ok(SentReply {
            id: sent.id,
            thread_id: sent.thread_id,
        })
    }

    async fn mark_read(&self, user_id: &str, message_id: &str) -> Result<(), PipelineError> {
        let request = self
            .http
            .post(self.url(&format!("messages/{message_id}/modify")))
            .json(&json!({"removeLabelIds": ["UNREAD"]}));
        self.send_authed(user_id, request, message_id).await?;
        Ok(())
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

fn to_mail_message(raw: GmailMessage) -> MailMessage {
    let payload = raw.payload.unwrap_or_default();
    let from = header(&payload, "From").unwrap_or_default();
    let (sender, sender_name) = parse_sender(from);

    let body = extract_body(&payload)
        .or(raw.snippet)
        .unwrap_or_default();

    MailMessage {
        id: raw.id,
        thread_id: raw.thread_id,
        sender,
        sender_name,
        subject: header(&payload, "Subject").unwrap_or_default().to_string(),
        body: truncate_content(body.trim()),
        rfc822_message_id: header(&payload, "Message-ID").map(str::to_string),
        received_at: raw
            .internal_date
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

fn is_throttled(body: &str) -> bool {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    envelope
        .error
        .into_iter()
        .flat_map(|detail| detail.errors)
        .chain(envelope.errors)
        .any(|e| {
            let reason = e.reason.to_ascii_lowercase();
            reason.contains("ratelimit") || reason.contains("quota")
        })
}

fn header<'a>(part: &'a MessagePart, name: &str) -> Option<&'a str> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Split a From header into a lowercased address and an optional display name.
fn parse_sender(from: &str) -> (String, Option<String>) {
    let from = from.trim();
    if let (Some(open), Some(close)) = (from.rfind('<'), from.rfind('>'))
        && open < close
        && from[open + 1..close].contains('@')
    {
        let address = from[open + 1..close].trim().to_lowercase();
        let name = from[..open].trim().trim_matches('"').trim();
        return (address, (!name.is_empty()).then(|| name.to_string()));
    }
    (from.to_lowercase(), None)
}

/// Plain text if any part has it, otherwise tag-stripped HTML.
fn extract_body(payload: &MessagePart) -> Option<String> {
    if let Some(text) = find_part(payload, "text/plain") {
        return Some(text);
    }
    find_part(payload, "text/html").map(|html| strip_html(&html))
}

fn find_part(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case(mime_type)
        && let Some(text) = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_body)
    {
        return Some(text);
    }
    part.parts.iter().find_map(|p| find_part(p, mime_type))
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn strip_html(html: &str) -> String {
    let text = match HTML_TAG.as_ref() {
        Some(tag) => tag.replace_all(html, " ").into_owned(),
        None => html.to_string(),
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn build_reply(reply: &OutgoingReply) -> Result<Message, PipelineError> {
    let from: Mailbox = reply
        .from
        .parse()
        .map_err(|e| PipelineError::validation(format!("invalid from address: {e}")))?;
    let to: Mailbox = reply
        .to
        .parse()
        .map_err(|e| PipelineError::validation(format!("invalid to address: {e}")))?;

    let mut builder = Message::builder().from(from).to(to).subject(&reply.subject);
    if let Some(message_id) = &reply.in_reply_to {
        builder = builder
            .in_reply_to(message_id.clone())
            .references(message_id.clone());
    }
    builder
        .header(ContentType::TEXT_PLAIN)
        .body(reply.body.clone())
        .map_err(|e| PipelineError::validation(format!("failed to build reply: {e}")))
}
