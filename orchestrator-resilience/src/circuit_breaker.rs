//! ABOUTME: Circuit breaker with CLOSED/OPEN/HALF_OPEN states and a sliding failure window (spec §4.2)

use chrono::{DateTime, Utc};
use orchestrator_core::ports::{Clock, SystemClock};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub minimum_requests: u32,
    pub failure_rate_threshold: f64,
    pub window_ms: u64,
    pub open_duration_ms: u64,
    pub half_open_success_threshold: u32,
    pub timeout_ms: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_requests: 10,
            failure_rate_threshold: 50.0,
            window_ms: 60_000,
            open_duration_ms: 60_000,
            half_open_success_threshold: 2,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub state_changed_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            100.0 * (self.failure_count as f64) / (self.total_requests as f64)
        }
    }
}

#[derive(Debug, Error)]
#[error("circuit breaker '{name}' is open (state_changed_at={state_changed_at})")]
pub struct CircuitBreakerError {
    pub name: String,
    pub state_changed_at: DateTime<Utc>,
    pub stats: CircuitBreakerStats,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    at: DateTime<Utc>,
    success: bool,
}

pub struct Hooks<E> {
    on_open: Box<dyn Fn() + Send + Sync>,
    on_close: Box<dyn Fn() + Send + Sync>,
    on_half_open: Box<dyn Fn() + Send + Sync>,
    on_request: Box<dyn Fn() + Send + Sync>,
    on_success: Box<dyn Fn() + Send + Sync>,
    on_failure: Box<dyn Fn(&E) + Send + Sync>,
    should_trip: Box<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> Default for Hooks<E> {
    fn default() -> Self {
        Self {
            on_open: Box::new(|| {}),
            on_close: Box::new(|| {}),
            on_half_open: Box::new(|| {}),
            on_request: Box::new(|| {}),
            on_success: Box::new(|| {}),
            on_failure: Box::new(|_| {}),
            should_trip: Box::new(|_| true),
        }
    }
}

/// Builds a `Hooks<E>` one callback at a time; any callback left unset is a
/// no-op (spec §4.2's full hook set: `on_open`/`on_close`/`on_half_open`/
/// `on_request`/`on_success`/`on_failure`/`should_trip`).
pub struct HooksBuilder<E> {
    hooks: Hooks<E>,
}

impl<E> Default for HooksBuilder<E> {
    fn default() -> Self {
        Self {
            hooks: Hooks::default(),
        }
    }
}

impl<E> HooksBuilder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_open = Box::new(f);
        self
    }

    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_close = Box::new(f);
        self
    }

    pub fn on_half_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_half_open = Box::new(f);
        self
    }

    pub fn on_request(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_request = Box::new(f);
        self
    }

    pub fn on_success(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_success = Box::new(f);
        self
    }

    pub fn on_failure(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.hooks.on_failure = Box::new(f);
        self
    }

    pub fn should_trip(mut self, f: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.hooks.should_trip = Box::new(f);
        self
    }

    pub fn build(self) -> Hooks<E> {
        self.hooks
    }
}

struct Inner {
    state: CircuitState,
    state_changed_at: DateTime<Utc>,
    half_open_successes: u32,
    window: VecDeque<WindowEntry>,
    stats: CircuitBreakerStats,
}

/// A global-per-callee resilience primitive (spec §4.2). Cheaply clonable
/// via `Arc` internals, safe to call concurrently from many tasks.
pub struct CircuitBreaker<E> {
    name: String,
    config: CircuitBreakerConfig,
    hooks: Hooks<E>,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl<E> CircuitBreaker<E> {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        Self::with_hooks_and_clock(name, config, Hooks::default(), Arc::new(SystemClock))
    }

    /// Construct with a full hook set built via `HooksBuilder` — any hook
    /// left unset defaults to a no-op (spec §4.2).
    pub fn with_hooks(name: impl Into<String>, config: CircuitBreakerConfig, hooks: Hooks<E>) -> Arc<Self> {
        Self::with_hooks_and_clock(name, config, hooks, Arc::new(SystemClock))
    }

    /// Construct with an injected `Clock`, e.g. a fixed/mocked clock in
    /// tests that need to assert OPEN→HALF_OPEN transitions after
    /// `open_duration_ms` without real sleeps (spec §8 scenario 3).
    pub fn with_hooks_and_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        hooks: Hooks<E>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let now = clock.now();
        Arc::new(Self {
            name: name.into(),
            config,
            hooks,
            clock,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                state_changed_at: now,
                half_open_successes: 0,
                window: VecDeque::new(),
                stats: CircuitBreakerStats::default(),
            }),
        })
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.inner.read().stats.clone()
    }

    /// Gate a request: returns `Err` immediately if the circuit is OPEN
    /// and the open duration hasn't elapsed; otherwise admits the request
    /// (transitioning OPEN→HALF_OPEN on the first admitted request past
    /// `open_duration_ms`).
    fn admit(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.write();
        (self.hooks.on_request)();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = self
                    .clock
                    .now()
                    .signed_duration_since(inner.state_changed_at)
                    .num_milliseconds()
                    .max(0) as u64;
                if elapsed >= self.config.open_duration_ms {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    inner.stats.rejected_count += 1;
                    Err(CircuitBreakerError {
                        name: self.name.clone(),
                        state_changed_at: inner.state_changed_at,
                        stats: inner.stats.clone(),
                    })
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        info!(breaker = %self.name, from = ?inner.state, to = ?to, "circuit breaker transition");
        inner.state = to;
        inner.state_changed_at = self.clock.now();
        inner.stats.state_changed_at = Some(inner.state_changed_at);
        inner.half_open_successes = 0;
        inner.window.clear();
        match to {
            CircuitState::Open => (self.hooks.on_open)(),
            CircuitState::Closed => (self.hooks.on_close)(),
            CircuitState::HalfOpen => (self.hooks.on_half_open)(),
        }
    }

    fn prune_window(&self, inner: &mut Inner) {
        let cutoff = self.clock.now() - chrono::Duration::milliseconds(self.config.window_ms as i64);
        while let Some(front) = inner.window.front() {
            if front.at < cutoff {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.write();
        let now = self.clock.now();
        inner.stats.total_requests += 1;
        inner.stats.success_count += 1;
        inner.stats.last_success_time = Some(now);
        inner.window.push_back(WindowEntry { at: now, success: true });
        self.prune_window(&mut inner);
        (self.hooks.on_success)();

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    fn record_failure(&self, error: &E) {
        let trips = (self.hooks.should_trip)(error);
        let mut inner = self.inner.write();
        let now = self.clock.now();
        inner.stats.total_requests += 1;
        inner.stats.failure_count += 1;
        inner.stats.last_failure_time = Some(now);
        (self.hooks.on_failure)(error);

        if !trips {
            return;
        }

        inner.window.push_back(WindowEntry { at: now, success: false });
        self.prune_window(&mut inner);

        match inner.state {
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Closed => {
                let failures = inner.window.iter().filter(|e| !e.success).count() as u32;
                let total = inner.window.len() as u32;
                let rate = if total == 0 {
                    0.0
                } else {
                    100.0 * (failures as f64) / (total as f64)
                };
                let should_open = failures >= self.config.failure_threshold
                    || (total >= self.config.minimum_requests
                        && rate >= self.config.failure_rate_threshold);
                if should_open {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Runs `op` through the breaker, optionally racing a per-call
    /// timeout. A request is only counted (success or failure) if it was
    /// admitted past the gate.
    pub async fn call<T, F, Fut>(self: &Arc<Self>, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TimeoutMarker>,
    {
        self.admit().map_err(CallError::Open)?;

        let result = match self.config.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), op()).await {
                Ok(r) => r,
                Err(_) => Err(E::from(TimeoutMarker)),
            },
            None => op().await,
        };

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure(&error);
                Err(CallError::Failed(error))
            }
        }
    }
}

/// Marker type a caller's error enum converts from to represent "the
/// breaker's own timeout fired", analogous to `RetryOptions::timeout_error`.
pub struct TimeoutMarker;

#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("circuit open")]
    Open(CircuitBreakerError),
    #[error("operation failed")]
    Failed(E),
}
