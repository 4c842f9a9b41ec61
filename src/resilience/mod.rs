//! Resilience primitives shared by every call path into an external
//! dependency.
//!
//! - [`RateLimiter`]: fixed-window counters keyed by (actor, action)
//! - [`CircuitBreaker`]: closed / open / half-open guard keyed by actor
//! - [`RetryPolicy`]: bounded exponential backoff with a retryable predicate
//!
//! Limiter and breaker state lives behind [`StateStore`] so it can be shared
//! between tasks and swapped for a different backend.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use rate_limiter::{RateLimitDecision, RateLimitWindow, RateLimiter};
pub use retry::RetryPolicy;
pub use store::{InMemoryStateStore, StateStore};
