//! Configuration types.
//!
//! Every struct has a `Default` with the production constants.
//! `AppConfig::from_env()` overlays `MAILPILOT_*` environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Fixed-window rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window length.
    pub window: Duration,
    /// Requests allowed per window when no per-action limit is set.
    pub default_limit: u32,
    /// Per-action overrides, keyed by action name.
    pub action_limits: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            default_limit: 100,
            action_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, action: &str) -> u32 {
        self.action_limits
            .get(action)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Circuit breaker settings for one dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is admitted.
    pub cooldown: Duration,
}

impl CircuitBreakerConfig {
    /// Mail provider calls.
    pub fn provider() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300), // 5 minutes
        }
    }

    /// AI summarizer calls.
    pub fn summarizer() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::provider()
    }
}

/// Retry policy settings shared by provider and AI calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Backoff grows as `unit * base ^ attempt`.
    pub base: f64,
    pub unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: 2.0,
            unit: Duration::from_secs(1),
        }
    }
}

/// Per-user pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Candidate ids requested from the provider per discovery.
    pub discovery_page_size: u32,
    /// Messages processed per batch.
    pub batch_size: usize,
    /// Retry cap stamped on new message records.
    pub max_retries: u32,
    /// Credits debited per processed message.
    pub credits_per_message: i64,
    /// Records stuck in `processing` longer than this are failed.
    pub processing_timeout_minutes: i64,
    /// Users processed concurrently by bulk runs.
    pub bulk_concurrency: usize,
    /// Master switch for Gmail processing.
    pub gmail_processing_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            discovery_page_size: 10,
            batch_size: 5,
            max_retries: 3,
            credits_per_message: 1,
            processing_timeout_minutes: 30,
            bulk_concurrency: 4,
            gmail_processing_enabled: true,
        }
    }
}

/// Background cycle settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Interval between cycles when no cron expression is set.
    pub interval: Duration,
    /// Optional cron expression (seconds field first) overriding `interval`.
    pub cron: Option<String>,
    /// Last cycle older than this makes the health check degrade.
    pub stale_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300), // 5 minutes
            cron: None,
            stale_after: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Gmail REST client settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gmail.googleapis.com/gmail/v1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Anthropic summarizer settings.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub api_key: SecretString,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            api_key: SecretString::from(String::new()),
            model: "claude-3-haiku-20240307".to_string(),
            max_tokens: 500,
            temperature: 0.3,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Health/ops HTTP listener.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub accounts_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub rate_limit: RateLimitConfig,
    pub provider_breaker: CircuitBreakerConfig,
    pub summarizer_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub gmail: GmailConfig,
    pub summarizer: SummarizerConfig,
    pub http: HttpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/mailpilot.db"),
            accounts_path: PathBuf::from("./data/accounts.json"),
            log_dir: None,
            rate_limit: RateLimitConfig::default(),
            provider_breaker: CircuitBreakerConfig::provider(),
            summarizer_breaker: CircuitBreakerConfig::summarizer(),
            retry: RetryConfig::default(),
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
            gmail: GmailConfig::default(),
            summarizer: SummarizerConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MAILPILOT_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("MAILPILOT_ACCOUNTS_PATH") {
            config.accounts_path = PathBuf::from(path);
        }
        config.log_dir = std::env::var("MAILPILOT_LOG_DIR").ok().map(PathBuf::from);

        config.rate_limit.window =
            Duration::from_secs(env_or("MAILPILOT_RATE_LIMIT_WINDOW_SECS", 60)?);
        config.rate_limit.default_limit = env_or("MAILPILOT_RATE_LIMIT", 100)?;

        config.retry.max_attempts = env_or("MAILPILOT_RETRY_ATTEMPTS", 3)?;
        config.retry.base = env_or("MAILPILOT_RETRY_BASE", 2.0)?;

        config.pipeline.discovery_page_size = env_or("MAILPILOT_DISCOVERY_PAGE_SIZE", 10)?;
        config.pipeline.batch_size = env_or("MAILPILOT_BATCH_SIZE", 5)?;
        config.pipeline.max_retries = env_or("MAILPILOT_MAX_RETRIES", 3)?;
        config.pipeline.processing_timeout_minutes =
            env_or("MAILPILOT_PROCESSING_TIMEOUT_MINUTES", 30)?;
        config.pipeline.bulk_concurrency = env_or("MAILPILOT_BULK_CONCURRENCY", 4)?;
        config.pipeline.gmail_processing_enabled = env_or("MAILPILOT_GMAIL_PROCESSING", true)?;

        config.scheduler.enabled = env_or("MAILPILOT_BACKGROUND_PROCESSING", true)?;
        config.scheduler.interval =
            Duration::from_secs(env_or("MAILPILOT_CYCLE_INTERVAL_SECS", 300)?);
        config.scheduler.cron = std::env::var("MAILPILOT_CYCLE_CRON").ok();

        if let Ok(url) = std::env::var("MAILPILOT_GMAIL_BASE_URL") {
            config.gmail.base_url = url;
        }

        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        config.summarizer.api_key = SecretString::from(api_key);
        if let Ok(model) = std::env::var("MAILPILOT_SUMMARY_MODEL") {
            config.summarizer.model = model;
        }

        if let Ok(bind) = std::env::var("MAILPILOT_HTTP_BIND") {
            config.http.bind = bind;
        }

        Ok(config)
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_constants() {
        let rl = RateLimitConfig::default();
        assert_eq!(rl.window, Duration::from_secs(60));
        assert_eq!(rl.limit_for("email_discovery"), 100);

        assert_eq!(CircuitBreakerConfig::provider().failure_threshold, 5);
        assert_eq!(CircuitBreakerConfig::summarizer().failure_threshold, 3);
        assert_eq!(
            CircuitBreakerConfig::summarizer().cooldown,
            Duration::from_secs(300)
        );

        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.max_retries, 3);
        assert_eq!(pipeline.credits_per_message, 1);

        let app = AppConfig::default();
        assert_eq!(app.provider_breaker.failure_threshold, 5);
        assert_eq!(app.summarizer_breaker.failure_threshold, 3);
    }

    #[test]
    fn per_action_limit_overrides_default() {
        let mut rl = RateLimitConfig::default();
        rl.action_limits.insert("email_processing".into(), 10);
        assert_eq!(rl.limit_for("email_processing"), 10);
        assert_eq!(rl.limit_for("email_discovery"), 100);
    }

    #[test]
    fn env_or_falls_back_when_unset() {
        let value: u32 = env_or("MAILPILOT_TEST_SURELY_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
    }
}
