//! Cost event records and the sinks that receive them.
//!
//! Delivery is best-effort. The router logs sink failures and never lets
//! them fail a request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::admission::CacheMode;
use crate::dedup::RequestFingerprint;
use crate::registry::CapabilityTier;

/// One record per routed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEvent {
    pub event_id: Uuid,
    pub request_fingerprint: RequestFingerprint,
    /// Model that produced the response (for dedup hits: the original model)
    pub model: Option<String>,
    /// Tier the request was classified as
    pub tier: Option<CapabilityTier>,
    pub context_tokens: u64,
    pub user_tokens: u64,
    pub output_tokens: u64,
    pub cache_decision: CacheMode,
    /// The call read a previously written context
    pub cache_hit: bool,
    pub dedup_hit: bool,
    pub cost_with_policy: f64,
    /// Always-direct-call baseline
    pub cost_if_naive: f64,
    pub projected_cache_delta: f64,
    pub admission_anomaly: bool,
    pub attempted_models: Vec<String>,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl CostEvent {
    /// Event with every outcome field zeroed.
    pub fn new(request_fingerprint: RequestFingerprint) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            request_fingerprint,
            model: None,
            tier: None,
            context_tokens: 0,
            user_tokens: 0,
            output_tokens: 0,
            cache_decision: CacheMode::Skip,
            cache_hit: false,
            dedup_hit: false,
            cost_with_policy: 0.0,
            cost_if_naive: 0.0,
            projected_cache_delta: 0.0,
            admission_anomaly: false,
            attempted_models: Vec::new(),
            failed: false,
            error: None,
            latency_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// Money saved against the naive baseline.
    pub fn saving(&self) -> f64 {
        self.cost_if_naive - self.cost_with_policy
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Sink database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Receives cost events.
#[async_trait]
pub trait CostEventSink: Send + Sync {
    async fn record(&self, event: &CostEvent) -> Result<(), SinkError>;
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl CostEventSink for TracingSink {
    async fn record(&self, event: &CostEvent) -> Result<(), SinkError> {
        tracing::info!(
            event_id = %event.event_id,
            fingerprint = %event.request_fingerprint,
            model = event.model.as_deref().unwrap_or("-"),
            tier = event.tier.map(|t| t.as_str()).unwrap_or("-"),
            context_tokens = event.context_tokens,
            user_tokens = event.user_tokens,
            output_tokens = event.output_tokens,
            cache_decision = %event.cache_decision,
            cache_hit = event.cache_hit,
            dedup_hit = event.dedup_hit,
            cost_with_policy = event.cost_with_policy,
            cost_if_naive = event.cost_if_naive,
            projected_cache_delta = event.projected_cache_delta,
            admission_anomaly = event.admission_anomaly,
            attempted = ?event.attempted_models,
            failed = event.failed,
            error = event.error.as_deref().unwrap_or(""),
            latency_ms = event.latency_ms,
            "cost event"
        );
        Ok(())
    }
}

/// Keeps the most recent events in memory.
#[derive(Debug, Clone)]
pub struct MemorySink {
    capacity: usize,
    events: Arc<Mutex<VecDeque<CostEvent>>>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<CostEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// The last `n` events, newest first.
    pub fn recent(&self, n: usize) -> Vec<CostEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CostEventSink for MemorySink {
    async fn record(&self, event: &CostEvent) -> Result<(), SinkError> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}

/// Delivers each event to several sinks. One failing sink never stops the others.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn CostEventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn CostEventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn CostEventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl CostEventSink for FanoutSink {
    async fn record(&self, event: &CostEvent) -> Result<(), SinkError> {
        let results = futures::future::join_all(self.sinks.iter().map(|s| s.record(event))).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Unavailable(failures.join("; ")))
        }
    }
}
