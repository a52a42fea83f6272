//! Cache admission.
//!
//! Decides, per model and context, whether a provider-side cache write pays
//! for itself. First sightings are written only when the expected reuse for
//! contexts of that size on that model reaches the break-even count scaled by
//! the configured confidence. Contexts written recently are read.

mod controller;
mod tracker;

pub use controller::{
    AdmissionController, AdmissionPolicy, AdmissionReason, CacheDecision, CacheMode,
    PolicyOverride,
};
pub use tracker::{size_bucket, ReuseHistory, ReuseTracker, TrackerLimits};
