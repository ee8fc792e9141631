use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::SyncError;
use crate::metrics::CIRCUIT_BREAKER_TRANSITIONS_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub state: BreakerState,
    probe_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure: None,
            state: BreakerState::Closed,
            probe_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit breakers keyed by `operation:scope`, one independent state per key.
///
/// While closed every call goes through. After `failure_threshold`
/// consecutive failures the key opens and rejects calls without running them
/// until `cooldown` has elapsed since the last failure; the next call then
/// runs as the single half-open probe. A probe success closes the key and
/// clears the failure count, a probe failure reopens it.
///
/// Only keys with recorded failures hold an entry; a success removes it.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, CircuitBreakerState>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Runs `f` under the breaker for `operation:scope`. Only errors that
    /// [`SyncError::counts_against_breaker`] are recorded as failures; any
    /// other outcome means the backend answered and counts as a success.
    pub async fn call<F, Fut, T>(&self, operation: &str, scope: &str, f: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let permit = self.acquire(operation, scope)?;
        let result = f().await;
        match &result {
            Err(e) if e.counts_against_breaker() => permit.failure(),
            _ => permit.success(),
        }
        result
    }

    pub fn acquire(&self, operation: &str, scope: &str) -> Result<BreakerPermit<'_>, SyncError> {
        let key = breaker_key(operation, scope);
        let Some(mut breaker) = self.breakers.get_mut(&key) else {
            return Ok(BreakerPermit::new(self, operation, key));
        };

        match breaker.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                let elapsed = breaker
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.cooldown);
                if elapsed < self.config.cooldown {
                    return Err(SyncError::CircuitOpen {
                        operation: key,
                        retry_after: self.config.cooldown - elapsed,
                    });
                }
                breaker.state = BreakerState::HalfOpen;
                breaker.probe_in_flight = true;
                record_transition(operation, BreakerState::HalfOpen);
                tracing::info!("Circuit half-open, probing: {}", key);
            }
            BreakerState::HalfOpen => {
                if breaker.probe_in_flight {
                    return Err(SyncError::CircuitOpen {
                        operation: key,
                        retry_after: Duration::ZERO,
                    });
                }
                breaker.probe_in_flight = true;
            }
        }

        drop(breaker);
        Ok(BreakerPermit::new(self, operation, key))
    }

    pub fn state(&self, operation: &str, scope: &str) -> BreakerState {
        self.snapshot(operation, scope)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, operation: &str, scope: &str) -> Option<CircuitBreakerState> {
        self.breakers
            .get(&breaker_key(operation, scope))
            .map(|b| b.value().clone())
    }

    /// Drops closed breakers for `scope` so finished attempts do not linger.
    pub fn forget_scope(&self, scope: &str) {
        self.breakers.retain(|key, b| {
            let same_scope = key.split_once(':').is_some_and(|(_, s)| s == scope);
            !(same_scope && b.state == BreakerState::Closed)
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.breakers.len()
    }

    fn on_success(&self, operation: &str, key: &str) {
        if let Some((_, breaker)) = self.breakers.remove(key) {
            if breaker.state != BreakerState::Closed {
                tracing::info!("Circuit closed after successful probe: {}", key);
                record_transition(operation, BreakerState::Closed);
            }
        }
    }

    fn on_failure(&self, operation: &str, key: &str) {
        let mut breaker = self.breakers.entry(key.to_string()).or_default();
        breaker.consecutive_failures += 1;
        breaker.last_failure = Some(Instant::now());
        breaker.probe_in_flight = false;

        let should_open = breaker.state == BreakerState::HalfOpen
            || breaker.consecutive_failures >= self.config.failure_threshold;
        if should_open && breaker.state != BreakerState::Open {
            breaker.state = BreakerState::Open;
            record_transition(operation, BreakerState::Open);
            tracing::warn!(
                "Circuit opened: {} after {} consecutive failures",
                key,
                breaker.consecutive_failures
            );
        }
    }

    fn on_abandoned(&self, key: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.probe_in_flight = false;
        }
    }
}

/// Outcome slot for one admitted call. Dropping it unsettled (the caller
/// stopped waiting) releases a half-open probe without recording anything.
pub struct BreakerPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    operation: String,
    key: String,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(registry: &'a CircuitBreakerRegistry, operation: &str, key: String) -> Self {
        Self {
            registry,
            operation: operation.to_string(),
            key,
            settled: false,
        }
    }

    pub fn success(mut self) {
        self.settled = true;
        self.registry.on_success(&self.operation, &self.key);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.registry.on_failure(&self.operation, &self.key);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.on_abandoned(&self.key);
        }
    }
}

fn breaker_key(operation: &str, scope: &str) -> String {
    format!("{}:{}", operation, scope)
}

fn record_transition(operation: &str, state: BreakerState) {
    CIRCUIT_BREAKER_TRANSITIONS_TOTAL
        .with_label_values(&[operation, state.as_str()])
        .inc();
}
