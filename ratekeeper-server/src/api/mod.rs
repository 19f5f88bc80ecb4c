//! HTTP surface.

pub mod errors;
pub mod handlers;
pub mod models;

use axum::routing::{get, post};
use axum::Router;
use ratekeeper::Store;

use handlers::AppState;

/// Build the router. The introspection route exists only when `debug` is set.
pub fn create_router<S: Store>(state: AppState<S>, debug: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/reduce", post(handlers::reduce::<S>));
    if debug {
        router = router.route("/v1/debug/bucket", get(handlers::debug_bucket::<S>));
    }
    router.with_state(state)
}
