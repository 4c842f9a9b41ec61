//! Bounded exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::PipelineError;

type RetryPredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Retry settings plus the predicate deciding which errors are worth
/// another attempt. Cloning shares the predicate.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: f64,
    unit: Duration,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base", &self.base)
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Policy retrying whatever [`PipelineError::is_retryable`] accepts.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: config.base,
            unit: config.unit,
            retryable: Arc::new(PipelineError::is_retryable),
        }
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self::new(&RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        })
    }

    pub fn with_predicate(
        mut self,
        retryable: impl Fn(&PipelineError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(retryable);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based):
    /// `unit * base ^ attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.base.powi(attempt as i32);
        if !factor.is_finite() || factor < 0.0 {
            return self.unit;
        }
        self.unit.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned as-is.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let next = attempt + 1;
                    if next >= self.max_attempts || !(self.retryable)(&e) {
                        return Err(e);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        op = label,
                        attempt = next,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
            }
        }
    }
}
