//! Model profile and capability tier types.

use serde::{Deserialize, Serialize};

/// Ordinal capability classification used to bound which models may serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Advanced,
}

impl CapabilityTier {
    /// All tiers in ascending order.
    pub const ALL: [CapabilityTier; 5] = [
        CapabilityTier::Trivial,
        CapabilityTier::Simple,
        CapabilityTier::Moderate,
        CapabilityTier::Complex,
        CapabilityTier::Advanced,
    ];

    /// Lowercase string representation for JSON and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityTier::Trivial => "trivial",
            CapabilityTier::Simple => "simple",
            CapabilityTier::Moderate => "moderate",
            CapabilityTier::Complex => "complex",
            CapabilityTier::Advanced => "advanced",
        }
    }

    /// Parse a tier name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trivial" => Some(Self::Trivial),
            "simple" => Some(Self::Simple),
            "moderate" => Some(Self::Moderate),
            "complex" => Some(Self::Complex),
            "advanced" => Some(Self::Advanced),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pricing, latency and cache economics of a single model.
///
/// Profiles are immutable once loaded. The registry replaces the whole table
/// on refresh rather than mutating individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Provider name (must match a configured provider for HTTP dispatch)
    pub provider: String,
    /// Model name as the provider knows it
    pub name: String,
    /// Typical end-to-end latency in milliseconds
    #[serde(default)]
    pub avg_latency_ms: u64,
    /// Price per 1000 input tokens
    pub cost_per_1k_input_tokens: f64,
    /// Price per 1000 output tokens
    pub cost_per_1k_output_tokens: f64,
    /// Multiplier over the input rate charged when writing the context to cache
    #[serde(default = "default_write_multiplier")]
    pub cache_write_multiplier: f64,
    /// Multiplier over the input rate charged when reading a cached context
    #[serde(default = "default_read_multiplier")]
    pub cache_read_multiplier: f64,
    /// Provider-imposed floor below which caching is not allowed
    #[serde(default = "default_min_cacheable_tokens")]
    pub min_cacheable_tokens: u64,
    /// Capability tier this model can serve
    #[serde(alias = "tier")]
    pub capability_tier: CapabilityTier,
    /// Operator switch for provider-side caching on this model
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// How long the provider keeps a written context readable
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_write_multiplier() -> f64 {
    1.25
}

fn default_read_multiplier() -> f64 {
    0.10
}

fn default_min_cacheable_tokens() -> u64 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl ModelProfile {
    /// Stable model identifier: `provider/name`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.name)
    }

    /// Whether this profile answers to `id`, either `provider/name` or the bare name.
    pub fn matches(&self, id: &str) -> bool {
        match id.split_once('/') {
            Some((provider, name)) => provider == self.provider && name == self.name,
            None => id == self.name,
        }
    }

    /// Combined input + output price per 1000 tokens, used to order candidates.
    pub fn blended_rate(&self) -> f64 {
        self.cost_per_1k_input_tokens + self.cost_per_1k_output_tokens
    }

    /// Check the profile for values that would break the cost model.
    pub fn validate(&self) -> Result<(), String> {
        let id = self.id();
        if self.provider.is_empty() || self.name.is_empty() {
            return Err(format!("Model '{}' must have a provider and a name", id));
        }
        if self.cost_per_1k_input_tokens < 0.0 || self.cost_per_1k_output_tokens < 0.0 {
            return Err(format!("Model '{}' has a negative token rate", id));
        }
        if !(self.cache_write_multiplier > 0.0) || !(self.cache_read_multiplier > 0.0) {
            return Err(format!(
                "Model '{}' cache multipliers must be positive (write={}, read={})",
                id, self.cache_write_multiplier, self.cache_read_multiplier
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_profile(
    name: &str,
    tier: CapabilityTier,
    input: f64,
    output: f64,
    latency_ms: u64,
) -> ModelProfile {
    ModelProfile {
        provider: "test".to_string(),
        name: name.to_string(),
        avg_latency_ms: latency_ms,
        cost_per_1k_input_tokens: input,
        cost_per_1k_output_tokens: output,
        cache_write_multiplier: 1.25,
        cache_read_multiplier: 0.10,
        min_cacheable_tokens: 1024,
        capability_tier: tier,
        cache_enabled: true,
        cache_ttl_secs: 300,
    }
}
