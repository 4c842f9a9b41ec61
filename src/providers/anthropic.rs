//! Anthropic Messages API summarizer.
//!
//! One request per call; retries and circuit breaking happen in the
//! pipeline around [`Summarizer::summarize`].

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SummarizerConfig;
use crate::error::{ConfigError, PipelineError};
use crate::providers::{Summarizer, Summary, SummaryMetadata};

const PROVIDER: &str = "anthropic";
const API_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Raw model text longer than this is cut when it is not valid JSON.
const FALLBACK_SUMMARY_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Shape the prompt asks the model to answer with.
#[derive(Debug, Deserialize)]
struct SummaryPayload {
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    action_items: Vec<String>,
}

pub struct AnthropicSummarizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(config.api_key.expose_secret()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "ANTHROPIC_API_KEY".to_string(),
                message: format!("invalid header value: {e}"),
            }
        })?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::ParseError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Point the client at another host (mock servers in tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn complete(&self, prompt: String) -> Result<String, PipelineError> {
        let request = MessageRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![ApiMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::provider(PROVIDER, format!("HTTP request failed: {e}")))?;

        let status = response.status();
        debug!(status = %status, model = %self.model, "Summary response received");

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(PipelineError::Authentication {
                provider: PROVIDER.to_string(),
                reason: format!("API returned {status}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ProviderApi {
                provider: PROVIDER.to_string(),
                status: Some(status.as_u16()),
                reason: format!("API returned {status}: {body}"),
            });
        }

        let parsed: MessageResponse = response.json().await.map_err(|e| {
            PipelineError::provider(PROVIDER, format!("failed to parse API response: {e}"))
        })?;

        Ok(parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn summarize(
        &self,
        content: &str,
        metadata: &SummaryMetadata,
    ) -> Result<Summary, PipelineError> {
        let text = self.complete(build_prompt(content, metadata)).await?;
        Ok(parse_summary(&text))
    }
}

fn build_prompt(content: &str, metadata: &SummaryMetadata) -> String {
    let date = metadata
        .received_at
        .map(|d| d.to_rfc2822())
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        r#"Please analyze this email and summarize it concisely.

Email Details:
- Subject: {subject}
- From: {sender}
- Date: {date}

Email Content:
{content}

Respond with only a JSON object:
{{
    "summary": "two or three sentences",
    "key_points": ["point 1", "point 2"],
    "action_items": ["action 1"]
}}"#,
        subject = metadata.subject,
        sender = metadata.sender,
    )
}

/// Parse the model's reply. Anything that is not the requested JSON shape
/// becomes a plain summary with no key points or action items.
fn parse_summary(text: &str) -> Summary {
    let json = extract_json_object(text);
    match serde_json::from_str::<SummaryPayload>(&json) {
        Ok(payload) => Summary {
            summary: payload.summary.trim().to_string(),
            keywords: payload.key_points,
            action_items: payload.action_items,
        },
        Err(e) => {
            debug!(error = %e, "Summary reply is not JSON, using raw text");
            Summary {
                summary: text.trim().chars().take(FALLBACK_SUMMARY_CHARS).collect(),
                keywords: Vec::new(),
                action_items: Vec::new(),
            }
        }
    }
}

/// Extract a JSON object from model text that may wrap it in prose or
/// markdown fences.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
