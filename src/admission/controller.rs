use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::tracker::{ReuseTracker, TrackerLimits};
use crate::cost::{self, BreakEven};
use crate::dedup::ContextFingerprint;
use crate::registry::ModelProfile;

/// Cache instruction sent with a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Skip,
    Write,
    Read,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Skip => "skip",
            CacheMode::Write => "write",
            CacheMode::Read => "read",
        }
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the controller chose its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    CacheDisabled,
    BelowMinimum,
    NeverPaysOff,
    LowConfidence,
    ExpectedReuse,
    WarmCache,
}

/// Outcome of [`AdmissionController::decide`] for one (model, context).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheDecision {
    pub mode: CacheMode,
    pub reason: AdmissionReason,
    /// Projected saving versus never caching this context on this model.
    /// Negative means caching is expected to lose money.
    pub projected_delta: f64,
    pub break_even: BreakEven,
    /// Prior sightings of the context in the current window
    pub observed_reuses: u64,
    /// Reuse count the decision was based on
    pub expected_reuses: f64,
}

impl CacheDecision {
    fn skip(reason: AdmissionReason, break_even: BreakEven, observed: u64) -> Self {
        Self {
            mode: CacheMode::Skip,
            reason,
            projected_delta: 0.0,
            break_even,
            observed_reuses: observed,
            expected_reuses: 0.0,
        }
    }

    /// A cache write or read that is projected to cost more than not caching.
    pub fn is_anomaly(&self) -> bool {
        self.mode != CacheMode::Skip && self.projected_delta < 0.0
    }

    /// Per-call cost of serving `context_tokens` + `output_tokens` under this
    /// decision. A write is amortized over the reads expected to follow it.
    pub fn effective_cost(
        &self,
        profile: &ModelProfile,
        context_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let direct = cost::cost_without_cache(profile, context_tokens, output_tokens);
        match self.mode {
            CacheMode::Skip => direct,
            CacheMode::Read => cost::cost_with_cache(profile, context_tokens, output_tokens, false, true),
            CacheMode::Write => direct - self.projected_delta / (1.0 + self.expected_reuses),
        }
    }

    /// Cost actually charged for this one call.
    pub fn call_cost(&self, profile: &ModelProfile, context_tokens: u64, output_tokens: u64) -> f64 {
        cost::cost_with_cache(
            profile,
            context_tokens,
            output_tokens,
            self.mode == CacheMode::Write,
            self.mode == CacheMode::Read,
        )
    }
}

/// Operator override for one model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// `provider/name` or bare model name
    pub model: String,
    #[serde(default)]
    pub cache_enabled: Option<bool>,
    /// Raises the provider floor; never lowers it
    #[serde(default)]
    pub min_tokens: Option<u64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Tunables for cache admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Expected reuse must reach `break_even * confidence` before a first write
    pub confidence: f64,
    /// Assumed median reuse while history is thin
    pub cold_start_reuses: f64,
    pub min_history_samples: u64,
    pub window_requests: u64,
    pub window_secs: u64,
    pub history_capacity: u64,
    pub overrides: Vec<PolicyOverride>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            confidence: 1.0,
            cold_start_reuses: 1.0,
            min_history_samples: 8,
            window_requests: 1000,
            window_secs: 24 * 60 * 60,
            history_capacity: 256,
            overrides: Vec::new(),
        }
    }
}

impl AdmissionPolicy {
    pub fn validate(&self) -> Result<(), String> {
        let bad_confidence = |c: f64| !(c.is_finite() && c >= 0.0);
        if bad_confidence(self.confidence) {
            return Err(format!("admission confidence must be >= 0, got {}", self.confidence));
        }
        if bad_confidence(self.cold_start_reuses) {
            return Err(format!(
                "cold_start_reuses must be >= 0, got {}",
                self.cold_start_reuses
            ));
        }
        if self.window_requests == 0 || self.window_secs == 0 {
            return Err("admission window bounds must be positive".to_string());
        }
        for o in &self.overrides {
            if o.model.is_empty() {
                return Err("admission override is missing a model".to_string());
            }
            if let Some(c) = o.confidence {
                if bad_confidence(c) {
                    return Err(format!(
                        "admission override for '{}' has invalid confidence {}",
                        o.model, c
                    ));
                }
            }
        }
        Ok(())
    }

    fn limits(&self) -> TrackerLimits {
        TrackerLimits {
            window_requests: self.window_requests,
            window: Duration::from_secs(self.window_secs),
            history_capacity: self.history_capacity,
        }
    }
}

/// Policy with overrides indexed by model.
#[derive(Debug, Default)]
struct CompiledPolicy {
    policy: AdmissionPolicy,
    overrides: HashMap<String, PolicyOverride>,
}

impl CompiledPolicy {
    fn new(policy: AdmissionPolicy) -> Self {
        let overrides = policy
            .overrides
            .iter()
            .map(|o| (o.model.clone(), o.clone()))
            .collect();
        Self { policy, overrides }
    }

    fn override_for(&self, profile: &ModelProfile) -> Option<&PolicyOverride> {
        self.overrides
            .get(&profile.id())
            .or_else(|| self.overrides.get(&profile.name))
    }
}

/// Decides per (model, context) whether to skip, write or read the provider cache.
#[derive(Debug)]
pub struct AdmissionController {
    policy: RwLock<Arc<CompiledPolicy>>,
    tracker: ReuseTracker,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionPolicy::default())
    }
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            tracker: ReuseTracker::new(policy.limits()),
            policy: RwLock::new(Arc::new(CompiledPolicy::new(policy))),
        }
    }

    fn compiled(&self) -> Arc<CompiledPolicy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.compiled().policy.clone()
    }

    /// Swap in a new policy. Reuse statistics are kept.
    pub fn set_policy(&self, policy: AdmissionPolicy) -> Result<(), String> {
        policy.validate()?;
        self.tracker.set_limits(policy.limits());
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(CompiledPolicy::new(policy));
        Ok(())
    }

    pub fn tracker(&self) -> &ReuseTracker {
        &self.tracker
    }

    /// Decide how `profile` should treat the context `fp` of `context_tokens`.
    ///
    /// Read-only: call [`observe`](Self::observe) once the plan is committed.
    pub fn decide(
        &self,
        profile: &ModelProfile,
        fp: &ContextFingerprint,
        context_tokens: u64,
        now: Instant,
    ) -> CacheDecision {
        let compiled = self.compiled();
        let policy = &compiled.policy;
        let over = compiled.override_for(profile);

        let enabled = profile.cache_enabled && over.and_then(|o| o.cache_enabled).unwrap_or(true);
        let floor = profile
            .min_cacheable_tokens
            .max(over.and_then(|o| o.min_tokens).unwrap_or(0));
        let confidence = over
            .and_then(|o| o.confidence)
            .unwrap_or(policy.confidence);

        let break_even = cost::break_even_reuses(profile, context_tokens);
        let observed = self.tracker.sightings(fp, now);

        if !enabled {
            return CacheDecision::skip(AdmissionReason::CacheDisabled, break_even, observed);
        }
        if context_tokens < floor {
            return CacheDecision::skip(AdmissionReason::BelowMinimum, break_even, observed);
        }

        let direct = cost::input_cost(profile, context_tokens);
        let read = direct * profile.cache_read_multiplier;
        let id = profile.id();

        if self.tracker.written_within(
            &id,
            fp,
            Duration::from_secs(profile.cache_ttl_secs),
            now,
        ) {
            return CacheDecision {
                mode: CacheMode::Read,
                reason: AdmissionReason::WarmCache,
                projected_delta: direct - read,
                break_even,
                observed_reuses: observed,
                expected_reuses: observed as f64,
            };
        }

        let BreakEven::Reuses(needed) = break_even else {
            return CacheDecision::skip(AdmissionReason::NeverPaysOff, break_even, observed);
        };

        let median = match self.tracker.history(&id, context_tokens) {
            Some(h) if h.samples >= policy.min_history_samples => h.median as f64,
            _ => policy.cold_start_reuses,
        };
        let expected = median.max(observed as f64);

        if expected < needed as f64 * confidence {
            let mut decision =
                CacheDecision::skip(AdmissionReason::LowConfidence, break_even, observed);
            decision.expected_reuses = expected;
            return decision;
        }

        let write_premium = direct * profile.cache_write_multiplier - direct;
        CacheDecision {
            mode: CacheMode::Write,
            reason: AdmissionReason::ExpectedReuse,
            projected_delta: expected * (direct - read) - write_premium,
            break_even,
            observed_reuses: observed,
            expected_reuses: expected,
        }
    }

    /// Count one committed use of the context on `model_id`.
    pub fn observe(&self, fp: &ContextFingerprint, model_id: &str, context_tokens: u64, now: Instant) {
        self.tracker.observe(fp, model_id, context_tokens, now);
    }

    /// Record a successful cache write so later requests can read it.
    pub fn record_write(&self, model_id: &str, fp: &ContextFingerprint, now: Instant) {
        self.tracker.record_write(model_id, fp, now);
    }

    pub fn sweep(&self, now: Instant) -> usize {
        self.tracker.sweep(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{test_profile, CapabilityTier};

    fn opus_like() -> ModelProfile {
        let mut p = test_profile("opus", CapabilityTier::Advanced, 15.0, 75.0, 2500);
        p.min_cacheable_tokens = 10_000;
        p
    }

    fn sonnet_like() -> ModelProfile {
        let mut p = test_profile("sonnet", CapabilityTier::Complex, 3.0, 15.0, 1200);
        p.min_cacheable_tokens = 2000;
        p
    }

    #[tokio::test(start_paused = true)]
    async fn test_floor_always_skips() {
        let controller = AdmissionController::default();
        let profile = opus_like();
        let fp = ContextFingerprint::of("ctx");
        let now = Instant::now();
        for _ in 0..20 {
            let d = controller.decide(&profile, &fp, 5000, now);
            assert_eq!(d.mode, CacheMode::Skip);
            assert_eq!(d.reason, AdmissionReason::BelowMinimum);
            assert_eq!(d.projected_delta, 0.0);
            controller.observe(&fp, &profile.id(), 5000, now);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sighting_writes_then_reads() {
        let controller = AdmissionController::default();
        let profile = sonnet_like();
        let fp = ContextFingerprint::of("shared");
        let now = Instant::now();

        let first = controller.decide(&profile, &fp, 2500, now);
        assert_eq!(first.mode, CacheMode::Write);
        assert_eq!(first.break_even, BreakEven::Reuses(1));
        assert!(!first.is_anomaly());
        controller.observe(&fp, &profile.id(), 2500, now);
        controller.record_write(&profile.id(), &fp, now);

        let second = controller.decide(&profile, &fp, 2500, now + Duration::from_secs(10));
        assert_eq!(second.mode, CacheMode::Read);
        assert_eq!(second.reason, AdmissionReason::WarmCache);
        assert!(second.projected_delta > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_write_is_decided_again() {
        let controller = AdmissionController::default();
        let profile = sonnet_like();
        let fp = ContextFingerprint::of("shared");
        let t0 = Instant::now();
        controller.observe(&fp, &profile.id(), 2500, t0);
        controller.record_write(&profile.id(), &fp, t0);

        let later = controller.decide(&profile, &fp, 2500, t0 + Duration::from_secs(301));
        assert_eq!(later.mode, CacheMode::Write);
        assert_eq!(later.observed_reuses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_history_median_skips() {
        let controller = AdmissionController::default();
        let profile = sonnet_like();
        let now = Instant::now();
        // Plenty of evidence that contexts this size are never reused
        for _ in 0..16 {
            controller.tracker().record_sample(&profile.id(), 2500, 0);
        }
        let d = controller.decide(&profile, &ContextFingerprint::of("fresh"), 2500, now);
        assert_eq!(d.mode, CacheMode::Skip);
        assert_eq!(d.reason, AdmissionReason::LowConfidence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_use_traffic_learns_to_skip() {
        let controller = AdmissionController::default();
        let profile = sonnet_like();
        let t0 = Instant::now();

        let cold = controller.decide(&profile, &ContextFingerprint::of("first"), 2500, t0);
        assert_eq!(cold.mode, CacheMode::Write);

        for i in 0..1500 {
            let fp = ContextFingerprint::of(&format!("one-off-{}", i));
            controller.observe(&fp, &profile.id(), 2500, t0);
        }
        let later = t0 + Duration::from_secs(3600);
        assert!(controller.sweep(later) > 0);

        let d = controller.decide(&profile, &ContextFingerprint::of("fresh"), 2500, later);
        assert_eq!(d.mode, CacheMode::Skip);
        assert_eq!(d.reason, AdmissionReason::LowConfidence);
        assert_eq!(d.expected_reuses, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrides_disable_and_raise_floor() {
        let controller = AdmissionController::new(AdmissionPolicy {
            overrides: vec![
                PolicyOverride {
                    model: "sonnet".to_string(),
                    min_tokens: Some(4000),
                    ..PolicyOverride::default()
                },
                PolicyOverride {
                    model: "test/opus".to_string(),
                    cache_enabled: Some(false),
                    ..PolicyOverride::default()
                },
            ],
            ..AdmissionPolicy::default()
        });
        let now = Instant::now();
        let fp = ContextFingerprint::of("ctx");

        let d = controller.decide(&sonnet_like(), &fp, 2500, now);
        assert_eq!(d.reason, AdmissionReason::BelowMinimum);

        let d = controller.decide(&opus_like(), &fp, 20_000, now);
        assert_eq!(d.reason, AdmissionReason::CacheDisabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_confidence_requires_more_reuse() {
        let controller = AdmissionController::new(AdmissionPolicy {
            confidence: 3.0,
            ..AdmissionPolicy::default()
        });
        let profile = sonnet_like();
        let fp = ContextFingerprint::of("ctx");
        let now = Instant::now();
        assert_eq!(controller.decide(&profile, &fp, 2500, now).mode, CacheMode::Skip);

        for _ in 0..3 {
            controller.observe(&fp, &profile.id(), 2500, now);
        }
        assert_eq!(controller.decide(&profile, &fp, 2500, now).mode, CacheMode::Write);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_with_low_confidence_is_flagged() {
        let controller = AdmissionController::new(AdmissionPolicy {
            confidence: 0.0,
            cold_start_reuses: 0.0,
            ..AdmissionPolicy::default()
        });
        let profile = sonnet_like();
        let d = controller.decide(&profile, &ContextFingerprint::of("ctx"), 2500, Instant::now());
        assert_eq!(d.mode, CacheMode::Write);
        assert!(d.projected_delta < 0.0);
        assert!(d.is_anomaly());
    }

    #[test]
    fn test_effective_cost_amortizes_write() {
        let profile = sonnet_like();
        let decision = CacheDecision {
            mode: CacheMode::Write,
            reason: AdmissionReason::ExpectedReuse,
            // 1 read expected: 0.9 * 7.5 - 0.25 * 7.5
            projected_delta: 4.875,
            break_even: BreakEven::Reuses(1),
            observed_reuses: 0,
            expected_reuses: 1.0,
        };
        // (write 9.375 + read 0.75) / 2
        let effective = decision.effective_cost(&profile, 2500, 0);
        assert!((effective - 5.0625).abs() < 1e-9);
        assert!((decision.call_cost(&profile, 2500, 0) - 9.375).abs() < 1e-9);
    }

    #[test]
    fn test_policy_validation() {
        assert!(AdmissionPolicy::default().validate().is_ok());
        let bad = AdmissionPolicy {
            confidence: -1.0,
            ..AdmissionPolicy::default()
        };
        assert!(bad.validate().is_err());
        let no_window = AdmissionPolicy {
            window_requests: 0,
            ..AdmissionPolicy::default()
        };
        assert!(no_window.validate().is_err());
    }
}
