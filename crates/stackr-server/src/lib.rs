pub mod auth;
pub mod daemon;
pub mod error;
pub mod routes;
pub mod shutdown;
pub mod state;
pub mod watch;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the axum Router. `/deploy` requires the configured bearer token;
/// without one every deploy request is rejected.
pub fn build_router(app_state: state::AppState) -> Router {
    let auth = auth::AuthConfig::new(app_state.config.token.clone().unwrap_or_default());

    let protected = Router::new()
        .route("/deploy", post(routes::deploy::deploy))
        .layer(middleware::from_fn_with_state(auth, auth::auth_middleware));

    Router::new()
        .route("/healthz", get(routes::health::healthz))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
