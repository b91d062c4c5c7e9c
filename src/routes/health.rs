//! Health endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::config::AppState;

/// GET /health - liveness; always answers.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /ready - readiness; checks the session store and the index.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut redis = state.redis.clone();
    let redis_ok = redis::cmd("PING")
        .query_async::<_, String>(&mut redis)
        .await
        .is_ok();
    let index_ok = sqlx::query("SELECT 1")
        .fetch_one(state.index.pool())
        .await
        .is_ok();

    let status = if redis_ok && index_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "redis": redis_ok,
            "index": index_ok,
        })),
    )
}
