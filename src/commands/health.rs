use crate::state::AppState;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub cache_entries: i64,
    pub analyses_in_flight: usize,
    pub quote_sync_running: bool,
}

pub async fn build_health_response(started_at: Instant, pool: &SqlitePool) -> HealthResponse {
    let cache_entries = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_entries")
        .fetch_one(pool)
        .await;

    let (db, cache_entries) = match cache_entries {
        Ok(count) => ("ok", count),
        Err(_) => ("error", 0),
    };

    HealthResponse {
        status: if db == "ok" { "ok" } else { "degraded" },
        uptime_ms: started_at.elapsed().as_millis(),
        db,
        cache_entries,
        analyses_in_flight: 0,
        quote_sync_running: false,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    let mut response = build_health_response(state.started_at, &state.db_pool).await;
    response.analyses_in_flight = state.inflight.len();
    response.quote_sync_running = state
        .quote_sync
        .lock()
        .await
        .as_ref()
        .is_some_and(|handle| handle.is_running());
    response
}
