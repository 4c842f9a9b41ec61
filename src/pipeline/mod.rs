//! Email processing pipeline.
//!
//! Per user, work flows through:
//! 1. `DiscoveryEngine::discover()`: provider query → filter rules → `discovered` records
//! 2. `BatchCoordinator::run_batch()`: single-flight per user, oldest first
//! 3. `ProcessingEngine::process()`: fetch → summarize → reply → mark read → debit
//!
//! `PipelineOrchestrator` composes the three and is what the scheduler and
//! the ops API call.

pub mod batch;
pub mod discovery;
pub mod filter;
pub mod orchestrator;
pub mod processor;
pub mod types;

use std::sync::Arc;

use tracing::warn;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::providers::{MailProvider, Summarizer, TokenSource};
use crate::resilience::{CircuitBreaker, RateLimiter, RetryPolicy};
use crate::store::traits::{CreditLedger, MessageStore, UserStore};

pub use batch::{BatchCoordinator, FlightGuard, SingleFlight};
pub use discovery::DiscoveryEngine;
pub use orchestrator::PipelineOrchestrator;
pub use processor::ProcessingEngine;

/// Rate limiter action for discovery calls.
pub const ACTION_DISCOVERY: &str = "email_discovery";
/// Rate limiter action for per-message processing.
pub const ACTION_PROCESSING: &str = "email_processing";

/// External collaborators the pipeline reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserStore>,
    pub messages: Arc<dyn MessageStore>,
    pub ledger: Arc<dyn CreditLedger>,
    pub mail: Arc<dyn MailProvider>,
    pub summarizer: Arc<dyn Summarizer>,
    /// Mailbox connections behind `mail`.
    pub connections: Arc<dyn TokenSource>,
}

impl Collaborators {
    /// Put the user's mailbox connection in error when the provider
    /// rejected its credentials. Other errors are ignored.
    pub(crate) async fn flag_rejected_credentials(&self, user_id: &str, err: &PipelineError) {
        let PipelineError::Authentication { reason, .. } = err else {
            return;
        };
        if let Err(e) = self.connections.mark_connection_error(user_id, reason).await {
            warn!(user_id, error = %e, "Failed to flag mailbox connection");
        }
    }
}

/// Shared resilience state wrapped around every external call.
#[derive(Clone)]
pub struct Guards {
    pub rate_limiter: Arc<RateLimiter>,
    /// Keyed by user id.
    pub provider_breaker: Arc<CircuitBreaker>,
    /// Keyed by summarizer name.
    pub summarizer_breaker: Arc<CircuitBreaker>,
    pub retry: RetryPolicy,
}

impl Guards {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            provider_breaker: Arc::new(CircuitBreaker::new(
                "mail_provider",
                config.provider_breaker.clone(),
            )),
            summarizer_breaker: Arc::new(CircuitBreaker::new(
                "summarizer",
                config.summarizer_breaker.clone(),
            )),
            retry: RetryPolicy::new(&config.retry),
        }
    }
}
