use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/breakers/{provider}", get(breaker_stats))
        .route("/rate-limits/{provider}", get(rate_limit_stats))
}

async fn breaker_stats(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if state.config.resolve_provider(&format!("/{provider}")).is_none()
        && !state.config.providers.iter().any(|p| p.id == provider)
    {
        return Err(StatusCode::NOT_FOUND);
    }
    let stats = state.breaker.stats(&provider).await;
    Ok(Json(json!({
        "provider": provider,
        "state": stats.state.as_str(),
        "failures": stats.failures,
        "success": stats.success,
        "last_failure": stats.last_failure,
        "half_open_inflight": stats.half_open_inflight,
    })))
}

async fn rate_limit_stats(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Json<serde_json::Value> {
    let bucket = state.config.provider_bucket(&provider);
    let key = format!("ratelimit:provider:{}", urlencoding::encode(&provider));
    let raw = state.kv.get(&key).await.ok().flatten();
    Json(json!({
        "provider": provider,
        "configured": bucket.map(|b| json!({"rate": b.rate, "burst": b.burst})),
        "bucket_raw": raw,
    }))
}
