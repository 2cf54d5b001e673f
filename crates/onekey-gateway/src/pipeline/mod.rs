#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;
use serde_json::json;

use crate::breaker::BreakerState;
use crate::cache::{CacheEntry, ResponseCache};
use crate::error::ErrorKind;
use crate::headers::{redact_headers, strip_hop_by_hop, truncate_body};
use crate::observability::events;
use crate::state::AppState;
use crate::time::now_seconds;
use crate::upstream::{ForwardRequest, UpstreamResponse};

fn generate_request_id(host: &str) -> String {
    let nanos = now_seconds();
    let rand_suffix: u32 = rand::thread_rng().r#gen();
    format!("{host}-{nanos:.6}-{rand_suffix:08x}")
}

fn error_body(error: &str, extra: &[(&str, &str)]) -> Json<serde_json::Value> {
    let mut obj = serde_json::Map::new();
    obj.insert("error".to_string(), json!(error));
    for (k, v) in extra {
        obj.insert((*k).to_string(), json!(v));
    }
    Json(serde_json::Value::Object(obj))
}

fn entry_response(entry: &CacheEntry, extra_headers: Vec<(&'static str, String)>) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(ct) = entry.content_type.as_ref() {
        if let Ok(v) = HeaderValue::from_str(ct) {
            headers.insert(axum::http::header::CONTENT_TYPE, v);
        }
    }
    for (k, v) in extra_headers {
        if let Ok(value) = HeaderValue::from_str(&v) {
            headers.insert(k, value);
        }
    }
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    (status, headers, entry.body.clone()).into_response()
}

/// Per-request bookkeeping threaded through the pipeline so the terminal
/// `finish` call can emit consistent metrics, logs, and response headers
/// regardless of which step produced the response.
struct ReqCtx {
    request_id: String,
    method: Method,
    path: String,
    remote_addr: SocketAddr,
    start: Instant,
}

/// Orchestrates the KV/rate-limit/breaker/cache/upstream subsystems for a
/// single request: route resolution, rate limiting, fresh-cache lookup,
/// breaker admission, credential and size checks, then forwarding.
/// `allow.admitted` tracks whether the breaker actually admitted this
/// request into a half-open slot so `release_half_open_slot` is only
/// invoked for requests that hold one.
pub async fn handle(
    state: AppState,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    remote_addr: SocketAddr,
    body: Bytes,
) -> Response {
    let ctx = ReqCtx {
        request_id: generate_request_id(&state.host_id),
        method: method.clone(),
        path: uri.path().to_string(),
        remote_addr,
        start: Instant::now(),
    };
    let raw_query = uri.query().map(|q| q.to_string());

    events::request_start(&ctx.request_id, ctx.method.as_str(), &ctx.path);
    strip_hop_by_hop(&mut headers);

    // Step 1: route resolution.
    let Some(provider) = state.config.resolve_provider(&ctx.path).cloned() else {
        return finish(
            &state,
            &ctx,
            None,
            (StatusCode::NOT_FOUND, error_body("Provider not found", &[])).into_response(),
            StatusCode::NOT_FOUND.as_u16(),
            Some(ErrorKind::InvalidProvider),
        );
    };
    let path_after_prefix = ctx.path.strip_prefix(provider.prefix.as_str()).unwrap_or("");

    // Step 2: rate limiting, global -> provider -> ip, first rejection wins.
    if let Some(resp) = check_rate_limits(&state, &provider.id, &ctx.remote_addr).await {
        return finish(
            &state,
            &ctx,
            Some(&provider.id),
            resp,
            StatusCode::TOO_MANY_REQUESTS.as_u16(),
            Some(ErrorKind::RateLimit),
        );
    }

    // Step 3: fresh-cache short circuit while the breaker is closed.
    let cache_key = ResponseCache::key(&provider.id, &method, &ctx.path, raw_query.as_deref());
    if state.breaker.get_state(&provider.id).await == BreakerState::Closed {
        if let Some(entry) = state.cache.fresh_read(&cache_key).await {
            let status = entry.status;
            let resp = entry_response(&entry, vec![("x-cache", "HIT".to_string())]);
            return finish(&state, &ctx, Some(&provider.id), resp, status, Some(ErrorKind::CacheHit));
        }
    }

    // Step 4: circuit-breaker admission.
    let allow = state.breaker.allow_request(&provider.id).await;
    if !allow.admitted {
        return match state.cache.stale_read(&cache_key).await {
            Some(stale) => {
                let status = stale.entry.status;
                let resp = entry_response(
                    &stale.entry,
                    vec![
                        ("x-degraded", "cache".to_string()),
                        ("x-cache-age", format!("{:.2}", stale.age_seconds)),
                    ],
                );
                finish(&state, &ctx, Some(&provider.id), resp, status, Some(ErrorKind::DegradedCache))
            }
            None => {
                let mut resp = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    error_body(
                        "Service temporarily unavailable",
                        &[("reason", "circuit_breaker"), ("state", allow.state.as_str())],
                    ),
                )
                    .into_response();
                resp.headers_mut().insert("retry-after", HeaderValue::from_static("30"));
                finish(
                    &state,
                    &ctx,
                    Some(&provider.id),
                    resp,
                    StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                    Some(ErrorKind::CircuitBreaker),
                )
            }
        };
    }

    // Step 5: credential presence.
    if provider.api_key.is_none() && !matches!(provider.auth_type, crate::config::AuthType::None) {
        state.breaker.release_half_open_slot(&provider.id).await;
        return finish(
            &state,
            &ctx,
            Some(&provider.id),
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("Service configuration error", &[])).into_response(),
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            Some(ErrorKind::MissingApiKey),
        );
    }

    // Step 6: body-size enforcement.
    if body.len() > state.config.proxy.max_body_size {
        state.breaker.release_half_open_slot(&provider.id).await;
        return finish(
            &state,
            &ctx,
            Some(&provider.id),
            (StatusCode::PAYLOAD_TOO_LARGE, error_body("Request body too large", &[])).into_response(),
            StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
            Some(ErrorKind::RequestTooLarge),
        );
    }

    // Step 7: forward with retry, then record the outcome.
    events::upstream_request(
        &ctx.request_id,
        &provider.id,
        &provider.upstream,
        &redact_headers(&headers, &state.config.logging.sensitive_headers),
    );
    state.metrics.inc_active(&provider.id);
    let outcome = state
        .upstream
        .forward_with_retry(ForwardRequest {
            provider: &provider,
            method: method.clone(),
            path_after_prefix,
            raw_query: raw_query.as_deref(),
            headers: headers.clone(),
            body: body.clone(),
            request_id: &ctx.request_id,
        })
        .await;
    state.metrics.dec_active(&provider.id);

    let (resp, status, classification) = match outcome.response {
        Some(upstream_resp) => {
            events::upstream_response(&ctx.request_id, &provider.id, upstream_resp.status);
            let status = upstream_resp.status;
            let is_failure = outcome.classification.is_some_and(|k| k.is_breaker_failure());
            if is_failure {
                state.breaker.record_failure(&provider.id).await;
            } else {
                state.breaker.record_success(&provider.id).await;
                maybe_store_cache(&state, &cache_key, &method, &upstream_resp).await;
            }
            (
                build_upstream_response(&upstream_resp, &ctx.request_id, &provider.id),
                status,
                outcome.classification,
            )
        }
        None => {
            state.breaker.record_failure(&provider.id).await;
            match state.cache.stale_read(&cache_key).await {
                Some(stale) => {
                    let status = stale.entry.status;
                    let resp = entry_response(
                        &stale.entry,
                        vec![
                            ("x-degraded", "cache".to_string()),
                            ("x-cache-age", format!("{:.2}", stale.age_seconds)),
                        ],
                    );
                    (resp, status, Some(ErrorKind::DegradedCache))
                }
                None => {
                    let kind = outcome.classification.unwrap_or(ErrorKind::UpstreamError);
                    let resp = (
                        StatusCode::BAD_GATEWAY,
                        error_body("Upstream service error", &[("type", kind.as_str())]),
                    )
                        .into_response();
                    (resp, StatusCode::BAD_GATEWAY.as_u16(), Some(kind))
                }
            }
        }
    };

    // Step 8: release the half-open slot this request held, unconditionally.
    state.breaker.release_half_open_slot(&provider.id).await;
    let health = state.breaker.get_state(&provider.id).await;
    state.metrics.set_provider_health(&provider.id, health);

    finish(&state, &ctx, Some(&provider.id), resp, status, classification)
}

async fn check_rate_limits(state: &AppState, provider_id: &str, remote_addr: &SocketAddr) -> Option<Response> {
    if let Some(global) = state.config.rate_limit.global.as_ref() {
        let outcome = state.rate_limiter.check("global", "all", global.rate, global.burst).await;
        if !outcome.allowed {
            events::rate_limit_denied("global", "all");
            return Some(rate_limit_response("global"));
        }
    }

    if let Some(provider_bucket) = state.config.provider_bucket(provider_id) {
        let outcome = state
            .rate_limiter
            .check("provider", provider_id, provider_bucket.rate, provider_bucket.burst)
            .await;
        if !outcome.allowed {
            events::rate_limit_denied("provider", provider_id);
            return Some(rate_limit_response("provider"));
        }
    }

    if let Some(ip_bucket) = state.config.rate_limit.per_ip.as_ref() {
        let ip = remote_addr.ip().to_string();
        let outcome = state.rate_limiter.check("ip", &ip, ip_bucket.rate, ip_bucket.burst).await;
        if !outcome.allowed {
            events::rate_limit_denied("ip", &ip);
            return Some(rate_limit_response("ip"));
        }
    }

    None
}

fn rate_limit_response(scope: &str) -> Response {
    let mut resp = (
        StatusCode::TOO_MANY_REQUESTS,
        error_body("Rate limit exceeded", &[("type", scope)]),
    )
        .into_response();
    resp.headers_mut().insert("retry-after", HeaderValue::from_static("60"));
    resp
}

async fn maybe_store_cache(state: &AppState, cache_key: &str, method: &Method, resp: &UpstreamResponse) {
    if !ResponseCache::is_cacheable(method, resp.status, resp.body.len(), state.config.proxy.cache_max_body_size) {
        return;
    }
    let content_type = resp
        .headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    state.cache.store(cache_key, resp.status, &resp.body, content_type).await;
}

fn build_upstream_response(upstream_resp: &UpstreamResponse, request_id: &str, provider_id: &str) -> Response {
    let mut headers = upstream_resp.headers.clone();
    strip_hop_by_hop(&mut headers);
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert("x-proxy-request-id", v);
    }
    if let Ok(v) = HeaderValue::from_str(provider_id) {
        headers.insert("x-provider", v);
    }
    let status = StatusCode::from_u16(upstream_resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, headers, upstream_resp.body.clone()).into_response()
}

fn finish(
    state: &AppState,
    ctx: &ReqCtx,
    provider_id: Option<&str>,
    mut response: Response,
    status: u16,
    classification: Option<ErrorKind>,
) -> Response {
    let latency_ms = ctx.start.elapsed().as_secs_f64() * 1000.0;
    let provider_label = provider_id.unwrap_or("unknown");
    let method = ctx.method.as_str();

    state.metrics.record_request(provider_label, method);
    state.metrics.record_status(provider_label, method, status);
    if let Some(kind) = classification {
        state.metrics.record_error(provider_label, kind.as_str());
    }
    state.metrics.record_latency(provider_label, latency_ms);

    events::request_end(
        &ctx.request_id,
        provider_id,
        status,
        latency_ms,
        classification.map(|k| k.as_str()),
    );
    events::access_log(
        &ctx.request_id,
        method,
        &truncate_body(ctx.path.as_bytes(), 256),
        status,
        latency_ms,
        &ctx.remote_addr.to_string(),
    );

    if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().entry("x-proxy-request-id").or_insert(v);
    }
    response
}
