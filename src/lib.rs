//! cachewise - Cost-aware LLM request routing with cache admission
//!
//! This library provides the core of the cachewise service: the model
//! registry and cost model, cache admission, request deduplication,
//! complexity classification and the router that ties them together.

pub mod admission;
pub mod classifier;
pub mod config;
pub mod cost;
pub mod dedup;
pub mod error;
pub mod provider;
pub mod registry;
pub mod reload;
pub mod request;
pub mod router;
pub mod server;
pub mod sink;
pub mod storage;

pub use admission::{AdmissionController, AdmissionPolicy, CacheDecision, CacheMode};
pub use classifier::{ComplexityClassifier, TierBoundaries};
pub use config::Config;
pub use cost::BreakEven;
pub use dedup::{ContextFingerprint, DedupStore, RequestFingerprint};
pub use error::{Error, Result};
pub use provider::{ModelProvider, ProviderCall, ProviderError, ProviderReply};
pub use registry::{CapabilityTier, ModelProfile, ModelRegistry};
pub use request::{RoutableRequest, SamplingParams};
pub use router::{RouteResponse, Router};
pub use sink::{CostEvent, CostEventSink};
