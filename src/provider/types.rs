//! OpenAI-compatible wire types for the HTTP provider.

use serde::{Deserialize, Serialize};

use super::ProviderCall;
use crate::admission::CacheMode;
use crate::request::estimate_tokens;

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Extension: cache instruction for the context segment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Cache instruction attached to a request whose context should be written or read.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheControl {
    pub mode: CacheMode,
    pub ttl_secs: u64,
}

/// Chat completion response (OpenAI-compatible).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A completion choice.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl ChatCompletionRequest {
    /// Build the wire request for one provider call. The context becomes the
    /// system message; an empty context is omitted.
    pub fn from_call(call: &ProviderCall) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !call.context.is_empty() {
            messages.push(Message {
                role: "system".to_string(),
                content: call.context.clone(),
            });
        }
        messages.push(Message {
            role: "user".to_string(),
            content: call.user_input.clone(),
        });

        let cache_control = match call.cache {
            CacheMode::Skip => None,
            mode => Some(CacheControl {
                mode,
                ttl_secs: call.model.cache_ttl_secs,
            }),
        };

        Self {
            model: call.model.name.clone(),
            messages,
            temperature: call.sampling.temperature,
            top_p: call.sampling.top_p,
            max_tokens: call.sampling.max_output_tokens,
            stop: call.sampling.stop.clone(),
            cache_control,
        }
    }
}

impl ChatCompletionResponse {
    /// Text of the first choice, if any.
    pub fn output_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }

    /// Completion tokens from `usage`, estimated from the text when absent.
    pub fn output_tokens(&self) -> u64 {
        match &self.usage {
            Some(usage) => usage.completion_tokens,
            None => self.output_text().map(estimate_tokens).unwrap_or(0),
        }
    }
}
