//! HttpProvider against a mock OpenAI-compatible server.

use std::sync::Arc;
use std::time::Duration;

use cachewise::admission::CacheMode;
use cachewise::config::{ApiKey, Config, ProviderConfig};
use cachewise::provider::http::HttpProvider;
use cachewise::provider::{ModelProvider, ProviderCall, ProviderError};
use cachewise::registry::{CapabilityTier, ModelProfile};
use cachewise::request::{RoutableRequest, SamplingParams};
use cachewise::router::Router;
use cachewise::server::provider_pool;
use cachewise::sink::MemorySink;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer, timeout_ms: u64) -> HttpProvider {
    let config = ProviderConfig {
        name: "mock".to_string(),
        url: format!("{}/v1", server.uri()),
        api_key: Some(ApiKey::from("sk-test")),
        timeout_ms,
    };
    HttpProvider::new(&config, reqwest::Client::new())
}

fn call(cache: CacheMode) -> ProviderCall {
    ProviderCall {
        model: Arc::new(ModelProfile {
            provider: "mock".to_string(),
            name: "sonnet".to_string(),
            avg_latency_ms: 1000,
            cost_per_1k_input_tokens: 3.0,
            cost_per_1k_output_tokens: 15.0,
            cache_write_multiplier: 1.25,
            cache_read_multiplier: 0.1,
            min_cacheable_tokens: 1024,
            capability_tier: CapabilityTier::Complex,
            cache_enabled: true,
            cache_ttl_secs: 300,
        }),
        context: "You are terse.".to_string(),
        user_input: "Say hi".to_string(),
        sampling: SamplingParams {
            temperature: Some(0.5),
            ..Default::default()
        },
        cache,
    }
}

fn completion(text: &str, completion_tokens: u64) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "model": "sonnet",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": completion_tokens}
    })
}

#[tokio::test]
async fn test_success_sends_cache_instruction_and_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "sonnet",
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": "Say hi"}
            ],
            "cache_control": {"mode": "write", "ttl_secs": 300}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("hi", 7)))
        .expect(1)
        .mount(&server)
        .await;

    let reply = provider(&server, 5000)
        .invoke(call(CacheMode::Write))
        .await
        .unwrap();
    assert_eq!(reply.output, "hi");
    assert_eq!(reply.output_tokens, 7);
}

#[tokio::test]
async fn test_status_codes_map_to_provider_errors() {
    let cases = [
        (429, "slow down"),
        (503, "overloaded"),
        (400, "bad request"),
    ];
    for (status, body) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;

        let err = provider(&server, 5000)
            .invoke(call(CacheMode::Skip))
            .await
            .unwrap_err();
        match status {
            429 => assert_eq!(err, ProviderError::RateLimited),
            503 => assert!(matches!(err, ProviderError::Fault(ref m) if m.contains("503"))),
            _ => assert_eq!(
                err,
                ProviderError::Rejected {
                    status: 400,
                    message: "bad request".to_string()
                }
            ),
        }
    }
}

#[tokio::test]
async fn test_slow_response_is_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("late", 3))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let err = provider(&server, 50)
        .invoke(call(CacheMode::Skip))
        .await
        .unwrap_err();
    assert_eq!(err, ProviderError::Timeout(50));
}

#[tokio::test]
async fn test_missing_usage_estimates_output_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "twelve chars"}}]
        })))
        .mount(&server)
        .await;

    let reply = provider(&server, 5000)
        .invoke(call(CacheMode::Skip))
        .await
        .unwrap();
    assert_eq!(reply.output_tokens, 3);
}

#[tokio::test]
async fn test_router_dispatches_through_configured_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "haiku"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("routed", 4)))
        .expect(1)
        .mount(&server)
        .await;

    let toml = format!(
        r#"
        [[providers]]
        name = "mock"
        url = "{}/v1"
        api_key = "sk-test"

        [[models]]
        provider = "mock"
        name = "haiku"
        tier = "simple"
        cost_per_1k_input_tokens = 0.25
        cost_per_1k_output_tokens = 1.25
        "#,
        server.uri()
    );
    let config = Config::parse_str(&toml).unwrap();
    let sink = MemorySink::default();
    let router = Router::from_config(
        &config,
        Arc::new(provider_pool(&config, &reqwest::Client::new())),
        Arc::new(sink.clone()),
    )
    .unwrap();

    let (response, event) = router
        .route(RoutableRequest::new("", "route me"))
        .await
        .unwrap();
    assert_eq!(response.output, "routed");
    assert_eq!(response.output_tokens, 4);
    assert_eq!(event.model.as_deref(), Some("mock/haiku"));
    assert_eq!(sink.len(), 1);
}

#[test]
fn test_provider_pool_keys_by_provider_name() {
    let config = Config::parse_str(
        r#"
        [[providers]]
        name = "beta"
        url = "http://127.0.0.1:1/v1"

        [[providers]]
        name = "alpha"
        url = "http://127.0.0.1:2/v1"
        "#,
    )
    .unwrap();

    let pool = provider_pool(&config, &reqwest::Client::new());
    assert_eq!(pool.names(), vec!["alpha".to_string(), "beta".to_string()]);
}
