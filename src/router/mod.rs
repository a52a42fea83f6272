//! Router module for model selection and dispatch.
//!
//! This module handles picking the model for a request based on:
//! - Capability tier (from the classifier, or a pinned model)
//! - Model health (circuit breakers)
//! - Effective cost under each model's cache decision

mod engine;
pub mod health;
pub mod retry;

pub use engine::{PlannedCall, RoutePlan, RouteResponse, Router, RouterBuilder, RouterSettings};
pub use health::{CircuitState, HealthRegistry, HealthSnapshot};
pub use retry::AttemptRecord;
