//! HTTP front end that throttles requests before they reach the handler.

mod middleware;
mod server;

use axum::routing::get;
use axum::Router;

pub use middleware::{rate_limit, GuardState, THROTTLED_MESSAGE};
pub use server::HttpServer;

/// Build the application router.
///
/// Everything except `/health` sits behind the rate limiting middleware.
pub fn router(state: GuardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route_layer(axum::middleware::from_fn_with_state(state, rate_limit))
        .route("/health", get(health))
}

async fn index() -> &'static str {
    "OK"
}

async fn health() -> &'static str {
    "healthy"
}
