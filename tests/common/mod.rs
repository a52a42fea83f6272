//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cachewise::admission::CacheMode;
use cachewise::provider::{ModelProvider, ProviderCall, ProviderError, ProviderReply};
use cachewise::registry::{CapabilityTier, ModelProfile, ModelRegistry};
use cachewise::router::Router;
use cachewise::sink::MemorySink;

/// Output size every scripted success reports.
pub const OUTPUT_TOKENS: u64 = 40;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub model: String,
    pub user_input: String,
    pub cache: CacheMode,
}

/// Provider double: answers every call unless told otherwise per model.
#[derive(Default)]
pub struct ScriptedProvider {
    /// One-shot results, consumed in order before falling back to the default
    scripts: Mutex<HashMap<String, VecDeque<Result<ProviderReply, ProviderError>>>>,
    /// Errors returned on every call
    failing: Mutex<HashMap<String, ProviderError>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one-shot results for `model_id`.
    pub fn script(&self, model_id: &str, results: Vec<Result<ProviderReply, ProviderError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_default()
            .extend(results);
    }

    /// Make every call to `model_id` fail with `error`.
    pub fn fail(&self, model_id: &str, error: ProviderError) {
        self.failing
            .lock()
            .unwrap()
            .insert(model_id.to_string(), error);
    }

    /// Delay every call to `model_id`.
    pub fn slow(&self, model_id: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(model_id.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, model_id: &str) -> usize {
        self.calls().iter().filter(|c| c.model == model_id).count()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn invoke(&self, call: ProviderCall) -> Result<ProviderReply, ProviderError> {
        let model = call.model.id();
        self.calls.lock().unwrap().push(RecordedCall {
            model: model.clone(),
            user_input: call.user_input.clone(),
            cache: call.cache,
        });

        let delay = self.delays.lock().unwrap().get(&model).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&model)
            .and_then(|queue| queue.pop_front());
        if let Some(result) = scripted {
            return result;
        }
        if let Some(error) = self.failing.lock().unwrap().get(&model).cloned() {
            return Err(error);
        }

        Ok(ProviderReply {
            output: format!("{} answered: {}", model, call.user_input),
            output_tokens: OUTPUT_TOKENS,
            latency_ms: 5,
        })
    }
}

pub fn profile(
    name: &str,
    tier: CapabilityTier,
    input: f64,
    output: f64,
    latency_ms: u64,
    min_cacheable_tokens: u64,
) -> ModelProfile {
    ModelProfile {
        provider: "test".to_string(),
        name: name.to_string(),
        avg_latency_ms: latency_ms,
        cost_per_1k_input_tokens: input,
        cost_per_1k_output_tokens: output,
        cache_write_multiplier: 1.25,
        cache_read_multiplier: 0.10,
        min_cacheable_tokens,
        capability_tier: tier,
        cache_enabled: true,
        cache_ttl_secs: 300,
    }
}

pub fn opus() -> ModelProfile {
    profile("opus", CapabilityTier::Advanced, 15.0, 75.0, 2500, 10_000)
}

pub fn sonnet() -> ModelProfile {
    profile("sonnet", CapabilityTier::Complex, 3.0, 15.0, 1200, 2000)
}

pub fn haiku() -> ModelProfile {
    profile("haiku", CapabilityTier::Simple, 0.25, 1.25, 400, 2048)
}

pub fn flash() -> ModelProfile {
    profile("flash", CapabilityTier::Simple, 0.30, 1.50, 300, 2048)
}

pub fn nano() -> ModelProfile {
    profile("nano", CapabilityTier::Trivial, 0.05, 0.20, 150, 4096)
}

/// Router over `profiles` with a memory sink.
pub fn router_with(
    profiles: Vec<ModelProfile>,
    provider: Arc<ScriptedProvider>,
) -> (Router, MemorySink) {
    let sink = MemorySink::default();
    let router = Router::new(
        ModelRegistry::new(profiles).unwrap(),
        provider,
        Arc::new(sink.clone()),
    )
    .unwrap();
    (router, sink)
}
