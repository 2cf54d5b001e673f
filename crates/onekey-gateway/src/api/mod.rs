pub mod admin;
pub mod health;
pub mod metrics;
pub mod proxy;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .nest("/admin", admin::router())
        .fallback(proxy::proxy)
        .with_state(state)
}
