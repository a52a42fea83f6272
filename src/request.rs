//! Inbound request types.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::CapabilityTier;

/// Sampling parameters that affect model output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A request to be routed. Immutable once built and consumed by a single `route` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutableRequest {
    /// Reusable system/context segment (the part worth caching)
    #[serde(default)]
    pub context: String,
    /// Per-call user segment
    pub user_input: String,
    /// Caller-supplied token estimate for `context`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
    /// Caller-supplied token estimate for `user_input`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tokens: Option<u64>,
    /// Requested minimum capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_hint: Option<CapabilityTier>,
    /// Pin the request to one model (`provider/name` or bare name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Caller idempotency hint, folded into the request fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Largest token count a caller may declare for one segment.
pub const MAX_DECLARED_TOKENS: u64 = 100_000_000;

/// Rough token estimate used when the caller does not supply counts (~4 chars/token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

impl RoutableRequest {
    pub fn new(context: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            user_input: user_input.into(),
            context_tokens: None,
            user_tokens: None,
            capability_hint: None,
            model: None,
            sampling: SamplingParams::default(),
            idempotency_key: None,
        }
    }

    /// Override the estimated token counts for both segments.
    pub fn with_token_counts(mut self, context_tokens: u64, user_tokens: u64) -> Self {
        self.context_tokens = Some(context_tokens);
        self.user_tokens = Some(user_tokens);
        self
    }

    pub fn with_hint(mut self, tier: CapabilityTier) -> Self {
        self.capability_hint = Some(tier);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn context_token_count(&self) -> u64 {
        self.context_tokens
            .unwrap_or_else(|| estimate_tokens(&self.context))
    }

    pub fn user_token_count(&self) -> u64 {
        self.user_tokens
            .unwrap_or_else(|| estimate_tokens(&self.user_input))
    }

    pub fn total_tokens(&self) -> u64 {
        self.context_token_count()
            .saturating_add(self.user_token_count())
    }

    /// Reject malformed requests before any provider is involved.
    pub fn validate(&self) -> Result<()> {
        if self.user_input.trim().is_empty() {
            return Err(Error::Validation("user_input must not be empty".to_string()));
        }
        if let Some(t) = self.sampling.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::Validation(format!(
                    "temperature must be within [0, 2], got {}",
                    t
                )));
            }
        }
        if let Some(p) = self.sampling.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::Validation(format!(
                    "top_p must be within (0, 1], got {}",
                    p
                )));
            }
        }
        if self.sampling.max_output_tokens == Some(0) {
            return Err(Error::Validation(
                "max_output_tokens must be greater than zero".to_string(),
            ));
        }
        for (field, count) in [
            ("context_tokens", self.context_tokens),
            ("user_tokens", self.user_tokens),
        ] {
            if let Some(n) = count.filter(|n| *n > MAX_DECLARED_TOKENS) {
                return Err(Error::Validation(format!(
                    "{} must be at most {}, got {}",
                    field, MAX_DECLARED_TOKENS, n
                )));
            }
        }
        if matches!(&self.model, Some(m) if m.trim().is_empty()) {
            return Err(Error::Validation("model must not be blank".to_string()));
        }
        Ok(())
    }
}
