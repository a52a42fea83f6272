//! Model registry with copy-on-write snapshots.
//!
//! Readers take an `Arc<RegistrySnapshot>` and keep it for the duration of
//! one routing decision. `refresh` builds a complete new table and swaps it
//! in under a short write lock, so no reader ever sees a partial update.

mod profile;

pub use profile::{CapabilityTier, ModelProfile};

#[cfg(test)]
pub(crate) use profile::test_profile;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};

/// Immutable view of the model table at one point in time.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    by_id: HashMap<String, Arc<ModelProfile>>,
    /// All profiles, cheapest-fastest first.
    ordered: Vec<Arc<ModelProfile>>,
}

impl RegistrySnapshot {
    fn build(version: u64, profiles: Vec<ModelProfile>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(profiles.len());
        let mut ordered = Vec::with_capacity(profiles.len());

        for profile in profiles {
            profile.validate().map_err(Error::Validation)?;
            let profile = Arc::new(profile);
            if by_id.insert(profile.id(), profile.clone()).is_some() {
                return Err(Error::Validation(format!(
                    "Duplicate model id '{}'",
                    profile.id()
                )));
            }
            ordered.push(profile);
        }

        ordered.sort_by(|a, b| {
            a.blended_rate()
                .total_cmp(&b.blended_rate())
                .then(a.avg_latency_ms.cmp(&b.avg_latency_ms))
                .then_with(|| a.id().cmp(&b.id()))
        });

        Ok(Self {
            version,
            by_id,
            ordered,
        })
    }

    /// Monotonic version, bumped on every refresh.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up a model by `provider/name` or, when unambiguous, by bare name.
    pub fn get(&self, model_id: &str) -> Result<Arc<ModelProfile>> {
        if let Some(profile) = self.by_id.get(model_id) {
            return Ok(profile.clone());
        }

        let mut matches = self.ordered.iter().filter(|p| p.matches(model_id));
        match (matches.next(), matches.next()) {
            (Some(profile), None) => Ok(profile.clone()),
            _ => Err(Error::ModelNotFound {
                model: model_id.to_string(),
            }),
        }
    }

    /// Models of exactly `tier`, cheapest-fastest first.
    pub fn list_by_tier(&self, tier: CapabilityTier) -> Vec<Arc<ModelProfile>> {
        self.ordered
            .iter()
            .filter(|p| p.capability_tier == tier)
            .cloned()
            .collect()
    }

    /// Models able to serve `tier` (equal or higher capability), cheapest-fastest first.
    pub fn candidates_for(&self, tier: CapabilityTier) -> Vec<Arc<ModelProfile>> {
        self.ordered
            .iter()
            .filter(|p| p.capability_tier >= tier)
            .cloned()
            .collect()
    }

    /// All models, cheapest-fastest first.
    pub fn all(&self) -> &[Arc<ModelProfile>] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Refreshable table of model profiles.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl ModelRegistry {
    /// Create a registry holding `profiles`.
    pub fn new(profiles: Vec<ModelProfile>) -> Result<Self> {
        Ok(Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::build(1, profiles)?)),
        })
    }

    /// Current snapshot. Hold it for the length of one routing decision.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole table. Invalid input leaves the current table untouched.
    ///
    /// Returns the new snapshot version.
    pub fn refresh(&self, profiles: Vec<ModelProfile>) -> Result<u64> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = RegistrySnapshot::build(guard.version + 1, profiles)?;
        let version = next.version;
        let count = next.len();
        *guard = Arc::new(next);
        drop(guard);

        tracing::info!(version, models = count, "Model registry refreshed");
        Ok(version)
    }

    pub fn get(&self, model_id: &str) -> Result<Arc<ModelProfile>> {
        self.snapshot().get(model_id)
    }

    pub fn list_by_tier(&self, tier: CapabilityTier) -> Vec<Arc<ModelProfile>> {
        self.snapshot().list_by_tier(tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profiles() -> Vec<ModelProfile> {
        vec![
            test_profile("opus", CapabilityTier::Advanced, 15.0, 75.0, 2500),
            test_profile("sonnet", CapabilityTier::Complex, 3.0, 15.0, 1200),
            test_profile("haiku", CapabilityTier::Simple, 0.25, 1.25, 400),
            test_profile("flash", CapabilityTier::Simple, 0.25, 1.25, 300),
            test_profile("nano", CapabilityTier::Trivial, 0.05, 0.2, 150),
        ]
    }

    #[test]
    fn test_get_by_full_and_bare_id() {
        let registry = ModelRegistry::new(sample_profiles()).unwrap();
        assert_eq!(registry.get("test/sonnet").unwrap().name, "sonnet");
        assert_eq!(registry.get("sonnet").unwrap().name, "sonnet");
        assert!(matches!(
            registry.get("gpt-9"),
            Err(Error::ModelNotFound { .. })
        ));
    }

    #[test]
    fn test_list_by_tier_orders_cheapest_then_fastest() {
        let registry = ModelRegistry::new(sample_profiles()).unwrap();
        let simple = registry.list_by_tier(CapabilityTier::Simple);
        let names: Vec<_> = simple.iter().map(|p| p.name.as_str()).collect();
        // Same price, flash is faster
        assert_eq!(names, vec!["flash", "haiku"]);
    }

    #[test]
    fn test_candidates_include_higher_tiers_only() {
        let registry = ModelRegistry::new(sample_profiles()).unwrap();
        let snapshot = registry.snapshot();
        let names: Vec<_> = snapshot
            .candidates_for(CapabilityTier::Complex)
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["sonnet", "opus"]);
        assert_eq!(snapshot.candidates_for(CapabilityTier::Trivial).len(), 5);
    }

    #[test]
    fn test_refresh_swaps_whole_table() {
        let registry = ModelRegistry::new(sample_profiles()).unwrap();
        let before = registry.snapshot();

        let version = registry
            .refresh(vec![test_profile(
                "solo",
                CapabilityTier::Moderate,
                1.0,
                2.0,
                500,
            )])
            .unwrap();

        assert_eq!(version, 2);
        // A reader holding the old snapshot still sees the old table
        assert_eq!(before.len(), 5);
        assert!(before.get("sonnet").is_ok());

        let after = registry.snapshot();
        assert_eq!(after.len(), 1);
        assert!(after.get("sonnet").is_err());
    }

    #[test]
    fn test_refresh_rejects_duplicates_and_keeps_current() {
        let registry = ModelRegistry::new(sample_profiles()).unwrap();
        let dup = vec![
            test_profile("a", CapabilityTier::Simple, 1.0, 1.0, 1),
            test_profile("a", CapabilityTier::Simple, 2.0, 2.0, 1),
        ];
        assert!(registry.refresh(dup).is_err());
        assert_eq!(registry.snapshot().len(), 5);
        assert_eq!(registry.snapshot().version(), 1);
    }
}
