//! ABOUTME: Cross-cutting resilience primitives: retry with backoff/jitter and a circuit breaker (spec §4.1, §4.2)

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats,
    CircuitState, Hooks, HooksBuilder, TimeoutMarker,
};
pub use retry::{retry, RetryError, RetryOptions};
