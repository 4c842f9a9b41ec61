//! User-defined inclusion/exclusion rules.
//!
//! Evaluation order (first match wins):
//! 1. excluded sender → `sender_excluded`
//! 2. excluded sender domain → `domain_excluded`
//! 3. include keywords set but none present → `include_keyword_missing`
//! 4. excluded keyword present → `keyword_excluded`
//! 5. body shorter than `min_length` → `content_too_short`
//!
//! Keyword matching is a case-insensitive substring test over subject + body.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::providers::{MailMessage, SUMMARY_SUBJECT_PREFIX};

/// A user's filter ruleset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    pub exclude_senders: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    /// Minimum body length in characters.
    pub min_length: usize,
}

/// Why a message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    SenderExcluded,
    DomainExcluded,
    IncludeKeywordMissing,
    KeywordExcluded,
    ContentTooShort,
}

impl FilterReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SenderExcluded => "sender_excluded",
            Self::DomainExcluded => "domain_excluded",
            Self::IncludeKeywordMissing => "include_keyword_missing",
            Self::KeywordExcluded => "keyword_excluded",
            Self::ContentTooShort => "content_too_short",
        }
    }
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterVerdict {
    pub should_process: bool,
    pub reason: Option<FilterReason>,
}

impl FilterVerdict {
    fn accept() -> Self {
        Self {
            should_process: true,
            reason: None,
        }
    }

    fn reject(reason: FilterReason) -> Self {
        Self {
            should_process: false,
            reason: Some(reason),
        }
    }
}

/// Evaluate `message` against `rules`.
pub fn evaluate(message: &MailMessage, rules: &FilterRules) -> FilterVerdict {
    let sender = message.sender.to_lowercase();

    if rules
        .exclude_senders
        .iter()
        .any(|s| s.trim().eq_ignore_ascii_case(&sender))
    {
        debug!(sender = %sender, "Filtered: sender excluded");
        return FilterVerdict::reject(FilterReason::SenderExcluded);
    }

    if let Some(domain) = message.sender_domain()
        && rules
            .exclude_domains
            .iter()
            .any(|d| d.trim().trim_start_matches('@').eq_ignore_ascii_case(domain))
    {
        debug!(domain, "Filtered: domain excluded");
        return FilterVerdict::reject(FilterReason::DomainExcluded);
    }

    let haystack = format!("{} {}", message.subject, message.body).to_lowercase();
    let contains = |keyword: &String| {
        let k = keyword.trim().to_lowercase();
        !k.is_empty() && haystack.contains(&k)
    };

    if !rules.include_keywords.is_empty() && !rules.include_keywords.iter().any(contains) {
        debug!(message_id = %message.id, "Filtered: no include keyword");
        return FilterVerdict::reject(FilterReason::IncludeKeywordMissing);
    }

    if rules.exclude_keywords.iter().any(contains) {
        debug!(message_id = %message.id, "Filtered: exclude keyword");
        return FilterVerdict::reject(FilterReason::KeywordExcluded);
    }

    if message.body.chars().count() < rules.min_length {
        debug!(message_id = %message.id, "Filtered: content too short");
        return FilterVerdict::reject(FilterReason::ContentTooShort);
    }

    FilterVerdict::accept()
}

/// Render the provider search query for a ruleset.
///
/// Keyword inclusion can only be approximated in a search query, so
/// `evaluate` still runs on every fetched message.
pub fn build_query(rules: &FilterRules) -> String {
    let mut parts = vec![
        "is:unread".to_string(),
        format!("-subject:\"{SUMMARY_SUBJECT_PREFIX}\""),
    ];

    for sender in non_empty(&rules.exclude_senders) {
        parts.push(format!("-from:{sender}"));
    }
    for domain in non_empty(&rules.exclude_domains) {
        parts.push(format!("-from:*@{}", domain.trim_start_matches('@')));
    }

    let include: Vec<&str> = non_empty(&rules.include_keywords).collect();
    if !include.is_empty() {
        parts.push(format!("({})", include.join(" OR ")));
    }

    for keyword in non_empty(&rules.exclude_keywords) {
        parts.push(format!("-{keyword}"));
    }

    parts.join(" ")
}

fn non_empty(values: &[String]) -> impl Iterator<Item = &str> {
    values.iter().map(|v| v.trim()).filter(|v| !v.is_empty())
}
