//! Pure cost functions over a [`ModelProfile`].
//!
//! All amounts are in the profile's price unit (typically USD). Nothing here
//! touches shared state.

use serde::Serialize;

use crate::registry::ModelProfile;

/// Minimum number of cache reads needed to recover a cache write premium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reuses")]
pub enum BreakEven {
    /// Caching pays off after this many subsequent reads.
    Reuses(u64),
    /// Reading from cache is never cheaper than a direct call.
    Never,
}

impl BreakEven {
    pub fn is_finite(&self) -> bool {
        matches!(self, BreakEven::Reuses(_))
    }

    pub fn reuses(&self) -> Option<u64> {
        match self {
            BreakEven::Reuses(n) => Some(*n),
            BreakEven::Never => None,
        }
    }
}

impl std::fmt::Display for BreakEven {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakEven::Reuses(n) => write!(f, "{}", n),
            BreakEven::Never => f.write_str("never"),
        }
    }
}

/// Cost of `tokens` input tokens at the base rate.
pub fn input_cost(profile: &ModelProfile, tokens: u64) -> f64 {
    tokens as f64 / 1000.0 * profile.cost_per_1k_input_tokens
}

/// Cost of `tokens` output tokens.
pub fn output_cost(profile: &ModelProfile, tokens: u64) -> f64 {
    tokens as f64 / 1000.0 * profile.cost_per_1k_output_tokens
}

/// Cost of a call that processes the full context at the base input rate.
pub fn cost_without_cache(profile: &ModelProfile, context_tokens: u64, output_tokens: u64) -> f64 {
    input_cost(profile, context_tokens) + output_cost(profile, output_tokens)
}

/// Cost of a call that writes or reads the context through the provider cache.
///
/// A write takes precedence if both flags are set. With neither flag the
/// result equals [`cost_without_cache`].
pub fn cost_with_cache(
    profile: &ModelProfile,
    context_tokens: u64,
    output_tokens: u64,
    is_cache_write: bool,
    is_cache_read: bool,
) -> f64 {
    let multiplier = if is_cache_write {
        profile.cache_write_multiplier
    } else if is_cache_read {
        profile.cache_read_multiplier
    } else {
        1.0
    };
    input_cost(profile, context_tokens) * multiplier + output_cost(profile, output_tokens)
}

/// Number of cache reads after which a single cache write has paid for itself.
///
/// `ceil(write_premium / (direct_rate - read_rate))`, or [`BreakEven::Never`]
/// when a read costs at least as much as a direct call.
pub fn break_even_reuses(profile: &ModelProfile, context_tokens: u64) -> BreakEven {
    let direct = input_cost(profile, context_tokens);
    let read = direct * profile.cache_read_multiplier;
    let saving_per_read = direct - read;
    if saving_per_read <= 0.0 {
        return BreakEven::Never;
    }

    let write_premium = direct * profile.cache_write_multiplier - direct;
    if write_premium <= 0.0 {
        return BreakEven::Reuses(0);
    }

    // Small tolerance so an exact ratio like 2.0000000001 doesn't round up to 3
    let ratio = write_premium / saving_per_read;
    BreakEven::Reuses((ratio - 1e-9).ceil().max(0.0) as u64)
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

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_cost_without_cache() {
        let p = opus_like();
        // 5402/1000 * 15 + 500/1000 * 75
        assert!(approx(cost_without_cache(&p, 5402, 500), 81.03 + 37.5));
    }

    #[test]
    fn test_cost_with_cache_write_and_read() {
        let p = opus_like();
        let write = cost_with_cache(&p, 10_000, 0, true, false);
        let read = cost_with_cache(&p, 10_000, 0, false, true);
        let direct = cost_with_cache(&p, 10_000, 0, false, false);
        assert!(approx(write, 187.5));
        assert!(approx(read, 15.0));
        assert!(approx(direct, cost_without_cache(&p, 10_000, 0)));
    }

    #[test]
    fn test_write_never_cheaper_than_read_when_multipliers_ordered() {
        let p = opus_like();
        for ctx in [0u64, 1, 999, 5402, 10_000, 250_000] {
            for out in [0u64, 1, 400, 4096] {
                let write = cost_with_cache(&p, ctx, out, true, false);
                let read = cost_with_cache(&p, ctx, out, false, true);
                assert!(write >= read, "ctx={} out={}", ctx, out);
            }
        }
    }

    #[test]
    fn test_break_even_one_read_for_standard_multipliers() {
        // premium 0.25, saving 0.9 per read
        let p = test_profile("sonnet", CapabilityTier::Complex, 3.0, 15.0, 1200);
        assert_eq!(break_even_reuses(&p, 2500), BreakEven::Reuses(1));
    }

    #[test]
    fn test_break_even_expensive_write() {
        let mut p = test_profile("m", CapabilityTier::Complex, 3.0, 15.0, 1200);
        p.cache_write_multiplier = 2.0;
        p.cache_read_multiplier = 0.5;
        // premium 1.0, saving 0.5 per read
        assert_eq!(break_even_reuses(&p, 4000), BreakEven::Reuses(2));
    }

    #[test]
    fn test_break_even_never_when_read_not_cheaper() {
        let mut p = test_profile("m", CapabilityTier::Complex, 3.0, 15.0, 1200);
        p.cache_read_multiplier = 1.0;
        assert_eq!(break_even_reuses(&p, 4000), BreakEven::Never);
        assert!(!break_even_reuses(&p, 4000).is_finite());
    }

    #[test]
    fn test_break_even_zero_when_write_has_no_premium() {
        let mut p = test_profile("m", CapabilityTier::Complex, 3.0, 15.0, 1200);
        p.cache_write_multiplier = 1.0;
        assert_eq!(break_even_reuses(&p, 4000), BreakEven::Reuses(0));
    }

    #[test]
    fn test_break_even_empty_context_never_pays() {
        let p = opus_like();
        assert_eq!(break_even_reuses(&p, 0), BreakEven::Never);
    }
}
