//! Per-actor circuit breaker.
//!
//! ```text
//! closed ──(threshold failures)──▶ open ──(cooldown)──▶ half_open
//!    ▲                                                    │
//!    └───────────────(success)────────────────────────────┤
//!                          open ◀──────(failure)──────────┘
//! ```
//!
//! `check` must run before the protected call and `record_success` /
//! `record_failure` after it. [`CircuitBreaker::call`] does all three.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::PipelineError;
use crate::resilience::store::{InMemoryStateStore, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without touching the dependency.
    Open,
    /// One trial call is admitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker bookkeeping for one actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Set while the half-open trial call is outstanding.
    pub trial_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_success: None,
            trial_in_flight: false,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    store: Arc<dyn StateStore<String, CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_store(name, config, Arc::new(InMemoryStateStore::new()))
    }

    pub fn with_store(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore<String, CircuitBreakerState>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the breaker for `actor` (closed if never seen).
    pub fn state(&self, actor: &str) -> CircuitBreakerState {
        self.store.get(&actor.to_string()).unwrap_or_default()
    }

    /// Admit or reject a call for `actor`.
    pub fn check(&self, actor: &str) -> Result<(), PipelineError> {
        self.check_at(actor, Utc::now())
    }

    pub fn check_at(&self, actor: &str, now: DateTime<Utc>) -> Result<(), PipelineError> {
        let cooldown = ChronoDuration::from_std(self.config.cooldown)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));

        self.update(actor, |current| match current.state {
            CircuitState::Closed => (None, Ok(())),
            CircuitState::Open => {
                let cooled = current
                    .last_failure
                    .is_none_or(|at| now - at >= cooldown);
                if cooled {
                    let next = CircuitBreakerState {
                        state: CircuitState::HalfOpen,
                        trial_in_flight: true,
                        ..current.clone()
                    };
                    (Some(next), Ok(()))
                } else {
                    (None, Err(self.open_error(actor)))
                }
            }
            CircuitState::HalfOpen if current.trial_in_flight => {
                (None, Err(self.open_error(actor)))
            }
            CircuitState::HalfOpen => {
                let next = CircuitBreakerState {
                    trial_in_flight: true,
                    ..current.clone()
                };
                (Some(next), Ok(()))
            }
        })
    }

    /// Any success closes the circuit and clears the failure count.
    pub fn record_success(&self, actor: &str) {
        let now = Utc::now();
        let recovered = self.update(actor, |current| {
            let next = CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: current.last_failure,
                last_success: Some(now),
                trial_in_flight: false,
            };
            (Some(next), current.state != CircuitState::Closed)
        });
        if recovered {
            info!(breaker = %self.name, actor, "Circuit closed after successful call");
        }
    }

    pub fn record_failure(&self, actor: &str) {
        self.record_failure_at(actor, Utc::now());
    }

    pub fn record_failure_at(&self, actor: &str, now: DateTime<Utc>) {
        let threshold = self.config.failure_threshold;
        let opened = self.update(actor, |current| {
            let failure_count = current.failure_count.saturating_add(1);
            let open = failure_count >= threshold;
            let next = CircuitBreakerState {
                state: if open {
                    CircuitState::Open
                } else {
                    CircuitState::Closed
                },
                failure_count,
                last_failure: Some(now),
                last_success: current.last_success,
                trial_in_flight: false,
            };
            (Some(next), open.then_some(failure_count))
        });
        if let Some(failures) = opened {
            warn!(breaker = %self.name, actor, failures, "Circuit open");
        }
    }

    /// Run `f` under the breaker for `actor`.
    ///
    /// Errors from `f` count as failures only when they come from the
    /// dependency itself (see [`PipelineError::is_upstream_failure`]).
    pub async fn call<T, F, Fut>(&self, actor: &str, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.check(actor)?;
        match f().await {
            Ok(value) => {
                self.record_success(actor);
                Ok(value)
            }
            Err(e) => {
                if e.is_upstream_failure() {
                    self.record_failure(actor);
                } else {
                    self.release_trial(actor);
                }
                Err(e)
            }
        }
    }

    /// Give back a half-open trial slot without judging the dependency.
    pub fn release_trial(&self, actor: &str) {
        self.update(actor, |current| {
            if current.trial_in_flight {
                let next = CircuitBreakerState {
                    trial_in_flight: false,
                    ..current.clone()
                };
                (Some(next), ())
            } else {
                (None, ())
            }
        });
    }

    /// Close every circuit.
    pub fn reset(&self) {
        self.store.clear();
    }

    fn open_error(&self, actor: &str) -> PipelineError {
        PipelineError::CircuitOpen {
            actor: format!("{}:{actor}", self.name),
        }
    }

    /// Read-modify-write loop over the store. `f` returns the replacement
    /// state (or `None` to leave it alone) and the value to hand back.
    fn update<R>(
        &self,
        actor: &str,
        mut f: impl FnMut(&CircuitBreakerState) -> (Option<CircuitBreakerState>, R),
    ) -> R {
        let key = actor.to_string();
        loop {
            let stored = self.store.get(&key);
            let current = stored.clone().unwrap_or_default();
            let (next, out) = f(&current);
            match next {
                None => return out,
                Some(next) => {
                    if self.store.compare_and_swap(&key, stored.as_ref(), next) {
                        return out;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "gmail",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(300),
            },
        )
    }

    #[test]
    fn opens_at_threshold() {
        let cb = breaker(3);
        let t0 = Utc::now();
        cb.record_failure_at("u1", t0);
        cb.record_failure_at("u1", t0);
        assert_eq!(cb.state("u1").state, CircuitState::Closed);
        assert!(cb.check_at("u1", t0).is_ok());

        cb.record_failure_at("u1", t0);
        let s = cb.state("u1");
        assert_eq!(s.state, CircuitState::Open);
        assert_eq!(s.failure_count, 3);
        assert!(matches!(
            cb.check_at("u1", t0 + ChronoDuration::seconds(10)),
            Err(PipelineError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let cb = breaker(2);
        let t0 = Utc::now();
        cb.record_failure_at("u1", t0);
        cb.record_failure_at("u1", t0);

        let after = t0 + ChronoDuration::minutes(5);
        assert!(cb.check_at("u1", after).is_ok());
        assert_eq!(cb.state("u1").state, CircuitState::HalfOpen);
        assert!(cb.check_at("u1", after).is_err());

        cb.record_success("u1");
        let s = cb.state("u1");
        assert_eq!(s.state, CircuitState::Closed);
        assert_eq!(s.failure_count, 0);
        assert!(s.last_success.is_some());
        assert!(cb.check_at("u1", after).is_ok());
    }

    #[test]
    fn failed_trial_reopens() {
        let cb = breaker(2);
        let t0 = Utc::now();
        cb.record_failure_at("u1", t0);
        cb.record_failure_at("u1", t0);

        let after = t0 + ChronoDuration::minutes(6);
        assert!(cb.check_at("u1", after).is_ok());
        cb.record_failure_at("u1", after);
        assert_eq!(cb.state("u1").state, CircuitState::Open);
        // Cooldown restarts from the failed trial.
        assert!(cb.check_at("u1", after + ChronoDuration::minutes(1)).is_err());
        assert!(cb.check_at("u1", after + ChronoDuration::minutes(5)).is_ok());
    }

    #[test]
    fn success_resets_partial_failures() {
        let cb = breaker(3);
        cb.record_failure("u1");
        cb.record_failure("u1");
        cb.record_success("u1");
        cb.record_failure("u1");
        assert_eq!(cb.state("u1").failure_count, 1);
        assert_eq!(cb.state("u1").state, CircuitState::Closed);
    }

    #[test]
    fn actors_are_isolated() {
        let cb = breaker(1);
        cb.record_failure("u1");
        assert!(cb.check("u1").is_err());
        assert!(cb.check("u2").is_ok());
    }

    #[tokio::test]
    async fn call_skips_the_dependency_while_open() {
        let cb = breaker(2);
        let attempts = AtomicU32::new(0);

        for _ in 0..2 {
            let r: Result<(), _> = cb
                .call("u1", || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::provider("gmail", "boom"))
                })
                .await;
            assert!(r.is_err());
        }
        assert_eq!(cb.state("u1").state, CircuitState::Open);

        let r: Result<(), _> = cb
            .call("u1", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(r, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn call_ignores_caller_side_errors() {
        let cb = breaker(1);
        let r: Result<(), _> = cb
            .call("u1", || async { Err(PipelineError::validation("bad input")) })
            .await;
        assert!(r.is_err());
        assert_eq!(cb.state("u1").state, CircuitState::Closed);
        assert_eq!(cb.state("u1").failure_count, 0);
    }

    #[test]
    fn reset_closes_everything() {
        let cb = breaker(1);
        cb.record_failure("u1");
        cb.reset();
        assert_eq!(cb.state("u1"), CircuitBreakerState::default());
    }
}
