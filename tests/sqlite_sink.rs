//! Cost events persisted through the SQLite sink.

use std::time::Duration;

use cachewise::admission::CacheMode;
use cachewise::registry::CapabilityTier;
use cachewise::request::RoutableRequest;
use cachewise::sink::{CostEvent, CostEventSink};
use cachewise::storage::{insert_event, run_migrations, SqliteSink};
use cachewise::RequestFingerprint;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

async fn memory_pool() -> SqlitePool {
    // One connection so every query sees the same in-memory database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

fn served_event() -> CostEvent {
    let request = RoutableRequest::new("You are terse.", "Say hi");
    let mut event = CostEvent::new(RequestFingerprint::of(&request));
    event.model = Some("anthropic/sonnet".to_string());
    event.tier = Some(CapabilityTier::Complex);
    event.context_tokens = 2500;
    event.user_tokens = 12;
    event.output_tokens = 40;
    event.cache_decision = CacheMode::Write;
    event.cost_with_policy = 0.0098;
    event.cost_if_naive = 0.0081;
    event.projected_cache_delta = 0.0042;
    event.attempted_models = vec!["anthropic/haiku".to_string(), "anthropic/sonnet".to_string()];
    event.latency_ms = 812;
    event
}

async fn count(pool: &SqlitePool) -> i64 {
    sqlx::query("SELECT COUNT(*) AS n FROM cost_events")
        .fetch_one(pool)
        .await
        .unwrap()
        .get("n")
}

#[tokio::test]
async fn test_insert_event_stores_all_columns() {
    let pool = memory_pool().await;
    let event = served_event();

    insert_event(&pool, &event).await.unwrap();

    let row = sqlx::query("SELECT * FROM cost_events WHERE event_id = ?")
        .bind(event.event_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("model"), "anthropic/sonnet");
    assert_eq!(row.get::<String, _>("tier"), "complex");
    assert_eq!(row.get::<String, _>("cache_decision"), "write");
    assert_eq!(row.get::<i64, _>("context_tokens"), 2500);
    assert_eq!(row.get::<i64, _>("latency_ms"), 812);
    assert!(!row.get::<bool, _>("dedup_hit"));
    assert!(!row.get::<bool, _>("failed"));
    assert!((row.get::<f64, _>("cost_with_policy") - 0.0098).abs() < 1e-12);
    assert_eq!(
        row.get::<String, _>("attempted_models"),
        r#"["anthropic/haiku","anthropic/sonnet"]"#
    );
    assert_eq!(
        row.get::<String, _>("request_fingerprint"),
        event.request_fingerprint.as_str()
    );
    assert!(row.get::<Option<String>, _>("error").is_none());
}

#[tokio::test]
async fn test_failed_event_keeps_error_and_null_model() {
    let pool = memory_pool().await;
    let request = RoutableRequest::new("", "hello");
    let mut event = CostEvent::new(RequestFingerprint::of(&request));
    event.failed = true;
    event.error = Some("All candidates exhausted".to_string());

    insert_event(&pool, &event).await.unwrap();

    let row = sqlx::query("SELECT model, failed, error FROM cost_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(row.get::<Option<String>, _>("model").is_none());
    assert!(row.get::<bool, _>("failed"));
    assert_eq!(
        row.get::<String, _>("error"),
        "All candidates exhausted"
    );
}

#[tokio::test]
async fn test_duplicate_event_id_is_rejected() {
    let pool = memory_pool().await;
    let event = served_event();

    insert_event(&pool, &event).await.unwrap();
    assert!(insert_event(&pool, &event).await.is_err());
    assert_eq!(count(&pool).await, 1);
}

#[tokio::test]
async fn test_sink_writes_in_background() {
    let pool = memory_pool().await;
    let sink = SqliteSink::new(pool.clone());

    sink.record(&served_event()).await.unwrap();
    sink.record(&served_event()).await.unwrap();

    let mut stored = 0;
    for _ in 0..50 {
        stored = count(&pool).await;
        if stored == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored, 2);
}

#[tokio::test]
async fn test_sink_reports_closed_pool() {
    let pool = memory_pool().await;
    let sink = SqliteSink::new(pool.clone());
    pool.close().await;

    assert!(sink.record(&served_event()).await.is_err());
}
