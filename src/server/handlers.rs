//! HTTP request handlers.

use axum::{
    extract::{Query, State},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use super::AppState;
use crate::cost::break_even_reuses;
use crate::error::Error;
use crate::request::RoutableRequest;
use crate::router::retry::format_retries_header;
use crate::router::{CircuitState, RouteResponse};

/// Response header: id of the cost event emitted for the request (UUID v4).
pub const CACHEWISE_REQUEST_ID_HEADER: &str = "x-cachewise-request-id";
/// Response header: model that produced the response (`provider/name`).
pub const CACHEWISE_MODEL_HEADER: &str = "x-cachewise-model";
/// Response header: cost charged under the cache policy (decimal).
pub const CACHEWISE_COST_HEADER: &str = "x-cachewise-cost";
/// Response header: "true" when served from the dedup store.
pub const CACHEWISE_DEDUP_HEADER: &str = "x-cachewise-dedup-hit";
/// Response header: cache instruction used (`skip`, `write`, `read`).
pub const CACHEWISE_CACHE_HEADER: &str = "x-cachewise-cache-decision";
/// Response header: wall-clock latency in milliseconds (integer).
pub const CACHEWISE_LATENCY_MS_HEADER: &str = "x-cachewise-latency-ms";
/// Response header: models that failed before the one that answered.
pub const CACHEWISE_RETRIES_HEADER: &str = "x-cachewise-retries";

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
        Err(_) => tracing::debug!(header = name, "Skipping header with invalid value"),
    }
}

/// Attach cachewise metadata headers to a routed response.
fn attach_cachewise_headers(response: &mut Response, routed: &RouteResponse, latency_ms: u64) {
    insert_header(response, CACHEWISE_REQUEST_ID_HEADER, &routed.request_id.to_string());
    insert_header(response, CACHEWISE_MODEL_HEADER, &routed.model);
    insert_header(response, CACHEWISE_COST_HEADER, &format!("{:.6}", routed.cost));
    insert_header(
        response,
        CACHEWISE_DEDUP_HEADER,
        if routed.dedup_hit { "true" } else { "false" },
    );
    insert_header(response, CACHEWISE_CACHE_HEADER, routed.cache_decision.as_str());
    insert_header(response, CACHEWISE_LATENCY_MS_HEADER, &latency_ms.to_string());
    if let Some(retries) = format_retries_header(&routed.attempts) {
        insert_header(response, CACHEWISE_RETRIES_HEADER, &retries);
    }
}

/// Handle POST /v1/route
pub async fn route(
    State(state): State<AppState>,
    Json(request): Json<RoutableRequest>,
) -> Result<Response, Error> {
    let (routed, event) = state.router.route(request).await?;

    let body = serde_json::json!({
        "response": &routed,
        "event": &event,
    });
    let mut response = Json(body).into_response();
    attach_cachewise_headers(&mut response, &routed, event.latency_ms);
    Ok(response)
}

/// Handle GET /v1/models - registry with break-even at a tier-typical context size
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.router.registry().snapshot();
    let boundaries = state.router.classifier().boundaries();
    let health = state.router.health();

    let models: Vec<serde_json::Value> = snapshot
        .all()
        .iter()
        .map(|p| {
            let id = p.id();
            let typical = boundaries.typical_tokens(p.capability_tier);
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": p.provider,
                "tier": p.capability_tier,
                "avg_latency_ms": p.avg_latency_ms,
                "cost_per_1k_input_tokens": p.cost_per_1k_input_tokens,
                "cost_per_1k_output_tokens": p.cost_per_1k_output_tokens,
                "cache_enabled": p.cache_enabled,
                "min_cacheable_tokens": p.min_cacheable_tokens,
                "typical_context_tokens": typical,
                "cacheable_at_typical": p.cache_enabled && typical >= p.min_cacheable_tokens,
                "break_even_reuses": break_even_reuses(p, typical).reuses(),
                "circuit": health.state(&id).unwrap_or(CircuitState::Closed),
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "registry_version": snapshot.version(),
        "data": models
    }))
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let circuits = state.router.health().snapshot();
    let degraded = circuits.iter().any(|c| c.state != CircuitState::Closed);

    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "service": "cachewise",
        "models": state.router.registry().snapshot().len(),
        "dedup": state.router.dedup_stats(),
        "circuits": circuits,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Handle GET /v1/events - most recent cost events, newest first
pub async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let events = state.recent.recent(query.limit);
    Json(serde_json::json!({
        "count": events.len(),
        "events": events,
    }))
}
