//! Token-count based complexity classification.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::registry::CapabilityTier;
use crate::request::RoutableRequest;

/// Token thresholds separating the capability tiers.
///
/// `total < simple_min` is trivial, `total > advanced_above` is advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBoundaries {
    pub simple_min: u64,
    pub moderate_min: u64,
    pub complex_min: u64,
    pub advanced_above: u64,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            simple_min: 50,
            moderate_min: 200,
            complex_min: 1000,
            advanced_above: 5000,
        }
    }
}

impl TierBoundaries {
    /// Boundaries must be strictly increasing.
    pub fn validate(&self) -> Result<(), String> {
        if self.simple_min < self.moderate_min
            && self.moderate_min < self.complex_min
            && self.complex_min <= self.advanced_above
        {
            Ok(())
        } else {
            Err(format!(
                "Tier boundaries must increase: simple_min={} moderate_min={} complex_min={} advanced_above={}",
                self.simple_min, self.moderate_min, self.complex_min, self.advanced_above
            ))
        }
    }

    /// Tier structurally required by `total_tokens`.
    pub fn tier_for(&self, total_tokens: u64) -> CapabilityTier {
        if total_tokens < self.simple_min {
            CapabilityTier::Trivial
        } else if total_tokens < self.moderate_min {
            CapabilityTier::Simple
        } else if total_tokens < self.complex_min {
            CapabilityTier::Moderate
        } else if total_tokens <= self.advanced_above {
            CapabilityTier::Complex
        } else {
            CapabilityTier::Advanced
        }
    }

    /// A representative request size for `tier`: the middle of its range,
    /// or twice the lower bound for the open-ended advanced tier.
    pub fn typical_tokens(&self, tier: CapabilityTier) -> u64 {
        match tier {
            CapabilityTier::Trivial => self.simple_min / 2,
            CapabilityTier::Simple => (self.simple_min + self.moderate_min) / 2,
            CapabilityTier::Moderate => (self.moderate_min + self.complex_min) / 2,
            CapabilityTier::Complex => (self.complex_min + self.advanced_above) / 2,
            CapabilityTier::Advanced => self.advanced_above.saturating_mul(2),
        }
    }
}

/// Maps a request to the minimum tier allowed to serve it.
#[derive(Debug, Default)]
pub struct ComplexityClassifier {
    boundaries: RwLock<TierBoundaries>,
}

impl ComplexityClassifier {
    pub fn new(boundaries: TierBoundaries) -> Self {
        Self {
            boundaries: RwLock::new(boundaries),
        }
    }

    pub fn boundaries(&self) -> TierBoundaries {
        *self.boundaries.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in new boundaries. Invalid boundaries are rejected and the old ones kept.
    pub fn set_boundaries(&self, boundaries: TierBoundaries) -> Result<(), String> {
        boundaries.validate()?;
        *self.boundaries.write().unwrap_or_else(PoisonError::into_inner) = boundaries;
        Ok(())
    }

    /// Effective tier: a capability hint can raise the tier but never lower it
    /// below what the token count requires.
    pub fn classify(&self, request: &RoutableRequest) -> CapabilityTier {
        let by_size = self.boundaries().tier_for(request.total_tokens());
        match request.capability_hint {
            Some(hint) => hint.max(by_size),
            None => by_size,
        }
    }
}
