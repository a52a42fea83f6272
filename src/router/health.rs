//! Per-model circuit breakers.
//!
//! Closed -> Open after `failure_threshold` consecutive retryable failures,
//! Open -> Half-Open once `open_for` has elapsed, Half-Open admits a single
//! probe call which either closes the circuit or reopens it with a fresh timer.
//! Models whose circuit rejects calls are left out of candidate lists.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of one model's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub model: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub trip_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Returned when a model's circuit does not admit a call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Circuit open for model '{model}': {reason}")]
pub struct CircuitOpenError {
    pub model: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitKind {
    Normal,
    Probe,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trip_count: u32,
    probe_in_flight: bool,
    last_error: Option<String>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trip_count: 0,
            probe_in_flight: false,
            last_error: None,
        }
    }

    fn open_elapsed(&self, open_for: Duration) -> bool {
        self.opened_at
            .map(|at| Instant::now().duration_since(at) >= open_for)
            .unwrap_or(false)
    }

    /// Whether a call would currently be admitted, without taking a permit.
    fn would_admit(&self, open_for: Duration) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_elapsed(open_for),
            CircuitState::HalfOpen => !self.probe_in_flight,
        }
    }

    fn check(&mut self, model: &str, open_for: Duration) -> Option<PermitKind> {
        match self.state {
            CircuitState::Closed => Some(PermitKind::Normal),
            CircuitState::Open if self.open_elapsed(open_for) => {
                self.state = CircuitState::HalfOpen;
                self.probe_in_flight = true;
                tracing::info!(model = %model, "Circuit half-open, admitting probe");
                Some(PermitKind::Probe)
            }
            CircuitState::Open => None,
            CircuitState::HalfOpen if !self.probe_in_flight => {
                self.probe_in_flight = true;
                Some(PermitKind::Probe)
            }
            CircuitState::HalfOpen => None,
        }
    }

    fn success(&mut self, model: &str, kind: PermitKind) {
        self.failure_count = 0;
        if kind == PermitKind::Probe || self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.probe_in_flight = false;
            tracing::info!(model = %model, trip_count = self.trip_count, "Circuit closed: probe succeeded");
        }
    }

    fn failure(&mut self, model: &str, kind: PermitKind, message: &str, threshold: u32) {
        self.last_error = Some(message.to_string());
        if kind == PermitKind::Probe {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
            self.probe_in_flight = false;
            tracing::warn!(model = %model, trip_count = self.trip_count, "Circuit reopened: probe failed");
            return;
        }
        if self.state != CircuitState::Closed {
            return;
        }

        self.failure_count += 1;
        if self.failure_count >= threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
            self.trip_count += 1;
            tracing::warn!(
                model = %model,
                failure_count = self.failure_count,
                trip_count = self.trip_count,
                last_error = %message,
                "Circuit opened after consecutive failures"
            );
        }
    }
}

/// One breaker per model id, created on first use.
#[derive(Debug)]
pub struct HealthRegistry {
    breakers: DashMap<String, Mutex<Breaker>>,
    failure_threshold: AtomicU32,
    open_ms: AtomicU64,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

impl HealthRegistry {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        let registry = Self {
            breakers: DashMap::new(),
            failure_threshold: AtomicU32::new(0),
            open_ms: AtomicU64::new(0),
        };
        registry.set_thresholds(failure_threshold, open_for);
        registry
    }

    pub fn set_thresholds(&self, failure_threshold: u32, open_for: Duration) {
        self.failure_threshold
            .store(failure_threshold.max(1), Ordering::Relaxed);
        self.open_ms
            .store(open_for.as_millis() as u64, Ordering::Relaxed);
    }

    fn open_for(&self) -> Duration {
        Duration::from_millis(self.open_ms.load(Ordering::Relaxed))
    }

    /// Whether `model_id` would currently accept a call. Unknown models are healthy.
    pub fn is_available(&self, model_id: &str) -> bool {
        match self.breakers.get(model_id) {
            Some(entry) => entry
                .value()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .would_admit(self.open_for()),
            None => true,
        }
    }

    /// Take a permit for one call to `model_id`.
    pub fn acquire(&self, model_id: &str) -> Result<HealthPermit<'_>, CircuitOpenError> {
        let entry = self
            .breakers
            .entry(model_id.to_string())
            .or_insert_with(|| Mutex::new(Breaker::new()));
        let mut breaker = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
        match breaker.check(model_id, self.open_for()) {
            Some(kind) => Ok(HealthPermit {
                registry: self,
                model_id: model_id.to_string(),
                kind,
                resolved: false,
            }),
            None => Err(CircuitOpenError {
                model: model_id.to_string(),
                reason: breaker
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "probe in flight".to_string()),
            }),
        }
    }

    fn record(&self, model_id: &str, kind: PermitKind, failure: Option<&str>) {
        let Some(entry) = self.breakers.get(model_id) else {
            return;
        };
        let mut breaker = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
        match failure {
            None => breaker.success(model_id, kind),
            Some(message) => breaker.failure(
                model_id,
                kind,
                message,
                self.failure_threshold.load(Ordering::Relaxed),
            ),
        }
    }

    pub fn state(&self, model_id: &str) -> Option<CircuitState> {
        self.breakers.get(model_id).map(|entry| {
            entry
                .value()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .state
        })
    }

    /// All breakers, sorted by model id.
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let mut all: Vec<HealthSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let b = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
                HealthSnapshot {
                    model: entry.key().clone(),
                    state: b.state,
                    failure_count: b.failure_count,
                    trip_count: b.trip_count,
                    last_error: b.last_error.clone(),
                }
            })
            .collect();
        all.sort_by(|a, b| a.model.cmp(&b.model));
        all
    }
}

/// Permission for a single call. A probe permit dropped without a verdict
/// counts as a failed probe so the circuit never sticks in half-open.
#[derive(Debug)]
pub struct HealthPermit<'a> {
    registry: &'a HealthRegistry,
    model_id: String,
    kind: PermitKind,
    resolved: bool,
}

impl HealthPermit<'_> {
    pub fn kind(&self) -> PermitKind {
        self.kind
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.registry.record(&self.model_id, self.kind, None);
    }

    /// A retryable failure. Counts towards opening the circuit.
    pub fn failure(mut self, message: &str) {
        self.resolved = true;
        self.registry.record(&self.model_id, self.kind, Some(message));
    }

    /// The call failed for reasons unrelated to model health (e.g. a rejected
    /// request). A probe is still released as successful: the model answered.
    pub fn neutral(mut self) {
        self.resolved = true;
        if self.kind == PermitKind::Probe {
            self.registry.record(&self.model_id, self.kind, None);
        }
    }
}

impl Drop for HealthPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.kind == PermitKind::Probe {
            tracing::warn!(model = %self.model_id, "Probe dropped without resolution, treating as failure");
            self.registry
                .record(&self.model_id, self.kind, Some("probe dropped without resolution"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(registry: &HealthRegistry, model: &str) {
        for _ in 0..3 {
            registry.acquire(model).unwrap().failure("provider fault: 503");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_model_is_available() {
        let registry = HealthRegistry::default();
        assert!(registry.is_available("test/haiku"));
        assert_eq!(registry.state("test/haiku"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_open_circuit() {
        let registry = HealthRegistry::default();
        registry.acquire("m").unwrap().failure("timeout");
        registry.acquire("m").unwrap().failure("timeout");
        assert_eq!(registry.state("m"), Some(CircuitState::Closed));
        registry.acquire("m").unwrap().failure("timeout");
        assert_eq!(registry.state("m"), Some(CircuitState::Open));
        assert!(!registry.is_available("m"));

        let err = registry.acquire("m").unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let registry = HealthRegistry::default();
        registry.acquire("m").unwrap().failure("x");
        registry.acquire("m").unwrap().failure("x");
        registry.acquire("m").unwrap().success();
        registry.acquire("m").unwrap().failure("x");
        assert_eq!(registry.state("m"), Some(CircuitState::Closed));
        assert_eq!(registry.snapshot()[0].failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_probe_then_close() {
        let registry = HealthRegistry::default();
        trip(&registry, "m");

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(registry.acquire("m").is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(registry.is_available("m"));
        let probe = registry.acquire("m").unwrap();
        assert_eq!(probe.kind(), PermitKind::Probe);
        assert!(!registry.is_available("m"));
        assert!(registry.acquire("m").is_err());

        probe.success();
        assert_eq!(registry.state("m"), Some(CircuitState::Closed));
        assert_eq!(registry.acquire("m").unwrap().kind(), PermitKind::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_timer() {
        let registry = HealthRegistry::default();
        trip(&registry, "m");
        tokio::time::advance(Duration::from_secs(31)).await;
        registry.acquire("m").unwrap().failure("still down");
        assert_eq!(registry.state("m"), Some(CircuitState::Open));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!registry.is_available("m"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(registry.is_available("m"));
        assert_eq!(registry.snapshot()[0].trip_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_counts_as_failure() {
        let registry = HealthRegistry::default();
        trip(&registry, "m");
        tokio::time::advance(Duration::from_secs(31)).await;
        {
            let _probe = registry.acquire("m").unwrap();
        }
        assert_eq!(registry.state("m"), Some(CircuitState::Open));
        assert_eq!(
            registry.snapshot()[0].last_error.as_deref(),
            Some("probe dropped without resolution")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_thresholds_are_adjustable() {
        let registry = HealthRegistry::new(1, Duration::from_secs(5));
        registry.acquire("m").unwrap().failure("x");
        assert_eq!(registry.state("m"), Some(CircuitState::Open));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.is_available("m"));
    }
}
