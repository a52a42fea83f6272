//! Provider-call surface.
//!
//! The router only knows [`ModelProvider`]. Concrete providers (the HTTP one
//! in [`http`], or test doubles) implement it; [`ProviderPool`] picks the one
//! responsible for a model's `provider` field.

pub mod http;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::admission::CacheMode;
use crate::registry::ModelProfile;
use crate::request::SamplingParams;
use crate::router::retry::Retryable;

/// Everything a provider needs to execute one call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub model: Arc<ModelProfile>,
    pub context: String,
    pub user_input: String,
    pub sampling: SamplingParams,
    pub cache: CacheMode,
}

/// A successful provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub output: String,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

/// Provider call failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("rate limited")]
    RateLimited,

    #[error("provider fault: {0}")]
    Fault(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl ProviderError {
    /// Short category for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout(_) => "timeout",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::Fault(_) => "provider_fault",
            ProviderError::Rejected { .. } => "rejected",
        }
    }
}

impl Retryable for ProviderError {
    /// Timeouts, rate limits and faults may succeed elsewhere; a rejected
    /// request would be rejected by any model.
    fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected { .. })
    }
}

/// Executes calls against one provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn invoke(&self, call: ProviderCall) -> Result<ProviderReply, ProviderError>;
}

/// Routes each call to the provider named in its model profile.
#[derive(Default, Clone)]
pub struct ProviderPool {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ModelProvider for ProviderPool {
    async fn invoke(&self, call: ProviderCall) -> Result<ProviderReply, ProviderError> {
        let provider = self.providers.get(&call.model.provider).cloned().ok_or_else(|| {
            ProviderError::Fault(format!(
                "no provider '{}' configured for model '{}'",
                call.model.provider,
                call.model.id()
            ))
        })?;
        provider.invoke(call).await
    }
}
