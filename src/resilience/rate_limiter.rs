//! Fixed-window rate limiter keyed by (actor, action).

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::PipelineError;
use crate::resilience::store::{InMemoryStateStore, StateStore};

pub type RateLimitKey = (String, String);

/// Counter state for one (actor, action) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub limit: u32,
}

/// Outcome of a single `check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn StateStore<RateLimitKey, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStateStore::new()))
    }

    pub fn with_store(
        config: RateLimitConfig,
        store: Arc<dyn StateStore<RateLimitKey, RateLimitWindow>>,
    ) -> Self {
        Self { config, store }
    }

    /// Count one request against the (actor, action) window.
    pub fn check(&self, actor: &str, action: &str) -> RateLimitDecision {
        self.check_at(actor, action, Utc::now())
    }

    /// Like [`check`](Self::check), evaluated at an explicit instant.
    pub fn check_at(&self, actor: &str, action: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let key = (actor.to_string(), action.to_string());
        let limit = self.config.limit_for(action);
        let window = ChronoDuration::from_std(self.config.window)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));

        loop {
            let current = self.store.get(&key);
            let (next, allowed) = match &current {
                Some(w) if now - w.window_start <= window => {
                    if w.count < w.limit {
                        (
                            RateLimitWindow {
                                count: w.count + 1,
                                ..w.clone()
                            },
                            true,
                        )
                    } else {
                        (w.clone(), false)
                    }
                }
                // No window yet, or the old one expired.
                _ => (
                    RateLimitWindow {
                        count: limit.min(1),
                        window_start: now,
                        limit,
                    },
                    limit > 0,
                ),
            };

            let decision = RateLimitDecision {
                allowed,
                remaining: next.limit.saturating_sub(next.count),
                reset_time: next.window_start + window,
            };

            if current.as_ref() == Some(&next)
                || self.store.compare_and_swap(&key, current.as_ref(), next)
            {
                if !decision.allowed {
                    debug!(actor, action, reset_time = %decision.reset_time, "Rate limit reached");
                }
                return decision;
            }
        }
    }

    /// Hard variant of `check`: a rejected request becomes `RateLimited`.
    pub fn enforce(&self, actor: &str, action: &str) -> Result<RateLimitDecision, PipelineError> {
        let decision = self.check(actor, action);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(PipelineError::RateLimited {
                actor: actor.to_string(),
                action: action.to_string(),
                reset_at: decision.reset_time,
            })
        }
    }

    /// Current window for the pair, if any.
    pub fn window(&self, actor: &str, action: &str) -> Option<RateLimitWindow> {
        self.store.get(&(actor.to_string(), action.to_string()))
    }

    /// Forget every window.
    pub fn reset(&self) {
        self.store.clear();
    }
}
