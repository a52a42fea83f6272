//! Cost event persistence.

use sqlx::SqlitePool;

use crate::sink::CostEvent;

/// Insert one cost event.
pub async fn insert_event(pool: &SqlitePool, event: &CostEvent) -> Result<(), sqlx::Error> {
    let attempted = serde_json::to_string(&event.attempted_models).unwrap_or_else(|_| "[]".into());
    sqlx::query(
        "INSERT INTO cost_events (
            event_id, timestamp, request_fingerprint, model, tier,
            context_tokens, user_tokens, output_tokens,
            cache_decision, cache_hit, dedup_hit,
            cost_with_policy, cost_if_naive, projected_cache_delta, admission_anomaly,
            attempted_models, failed, error, latency_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.event_id.to_string())
    .bind(event.timestamp.to_rfc3339())
    .bind(event.request_fingerprint.as_str())
    .bind(event.model.as_deref())
    .bind(event.tier.map(|t| t.as_str()))
    .bind(event.context_tokens as i64)
    .bind(event.user_tokens as i64)
    .bind(event.output_tokens as i64)
    .bind(event.cache_decision.as_str())
    .bind(event.cache_hit)
    .bind(event.dedup_hit)
    .bind(event.cost_with_policy)
    .bind(event.cost_if_naive)
    .bind(event.projected_cache_delta)
    .bind(event.admission_anomaly)
    .bind(attempted)
    .bind(event.failed)
    .bind(event.error.as_deref())
    .bind(event.latency_ms as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Spawn a fire-and-forget insert.
///
/// If the write fails, a warning is logged but the error is not propagated.
pub fn spawn_event_write(pool: &SqlitePool, event: CostEvent) {
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = insert_event(&pool, &event).await {
            tracing::warn!(
                event_id = %event.event_id,
                error = %e,
                "Failed to write cost event to database"
            );
        }
    });
}
