//! OpenAI-compatible HTTP provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header;

use super::types::{ChatCompletionRequest, ChatCompletionResponse};
use super::{ModelProvider, ProviderCall, ProviderError, ProviderReply};
use crate::config::{ApiKey, ProviderConfig};

/// Calls `POST {url}/chat/completions` on one provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    url: String,
    api_key: Option<ApiKey>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn invoke(&self, call: ProviderCall) -> Result<ProviderReply, ProviderError> {
        let start = Instant::now();
        let body = ChatCompletionRequest::from_call(&call);

        let mut request = self
            .client
            .post(self.endpoint())
            .timeout(self.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            );
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout.as_millis() as u64)
            } else {
                tracing::error!(error = %e, provider = %self.name, "Failed to reach provider");
                ProviderError::Fault(format!("failed to reach provider '{}': {}", self.name, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = %status,
                provider = %self.name,
                model = %call.model.id(),
                body = %error_body,
                "Provider returned error"
            );
            return Err(if status.as_u16() == 429 {
                ProviderError::RateLimited
            } else if status.is_server_error() {
                ProviderError::Fault(format!("{} {}", status.as_u16(), error_body))
            } else {
                ProviderError::Rejected {
                    status: status.as_u16(),
                    message: error_body,
                }
            });
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout.as_millis() as u64)
            } else {
                ProviderError::Fault(format!("invalid response from '{}': {}", self.name, e))
            }
        })?;

        let output = parsed
            .output_text()
            .ok_or_else(|| ProviderError::Fault(format!("empty choices from '{}'", self.name)))?
            .to_string();

        Ok(ProviderReply {
            output_tokens: parsed.output_tokens(),
            output,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}
