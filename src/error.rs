//! Error types for mailpilot.

use chrono::{DateTime, Utc};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the processing pipeline and its collaborators.
///
/// The variants map one-to-one onto the failure modes callers react to:
/// batches halt on `InsufficientCredits` and keep going on everything else,
/// and `is_retryable` drives the shared retry policy.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bad input, illegal state transition or concurrency conflict.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Insufficient credits for user {user_id}: balance {balance}, requested {requested}")]
    InsufficientCredits {
        user_id: String,
        balance: i64,
        requested: i64,
    },

    #[error("Rate limit exceeded for {actor} on {action}, resets at {reset_at}")]
    RateLimited {
        actor: String,
        action: String,
        reset_at: DateTime<Utc>,
    },

    #[error("Circuit breaker open for {actor}")]
    CircuitOpen { actor: String },

    #[error("Provider {provider} request failed: {reason}")]
    ProviderApi {
        provider: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("Authentication failed for {provider}: {reason}")]
    Authentication { provider: String, reason: String },

    #[error("Store error: {0}")]
    Database(#[from] DatabaseError),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderApi {
            provider: provider.into(),
            status: None,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Transport failures, 429 and 5xx responses are transient. Everything
    /// else needs the caller (or the user) to change something first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderApi { status: None, .. } => true,
            Self::ProviderApi {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Whether the failure came from an upstream dependency and should
    /// count against its circuit breaker.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, Self::ProviderApi { .. } | Self::Authentication { .. })
    }

    /// Short machine-readable kind, used in result payloads and job metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProviderApi { .. } => "provider_api",
            Self::Authentication { .. } => "authentication",
            Self::Database(_) => "database",
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
