use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// Renders the process `Registry` as Prometheus exposition text.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let body = state.metrics.render_text();
    let mut resp = body.into_response();
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    resp
}
