use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let user_routes = Router::new()
        .route("/users", post(handlers::create_user))
        .route(
            "/users/:id",
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .route(
            "/users/:id/authenticate",
            post(handlers::authenticate_user),
        );

    let token_routes = Router::new()
        .route("/tokens", post(handlers::issue_token))
        .route("/tokens/verify", post(handlers::verify_token));

    let mut router = Router::new()
        .route("/status", get(handlers::status))
        .merge(user_routes)
        .merge(token_routes);

    // Operator routes carry no authentication, so they are opt-in. The state
    // switch is never gated so it can reopen the service.
    if state.config.admin_routes {
        tracing::warn!("Admin routes enabled, /admin is unauthenticated");
        router = router
            .route("/admin/secrets/rotate", post(handlers::rotate_secret))
            .route("/admin/secrets/:key_id", delete(handlers::delete_secret))
            .route("/admin/state", put(handlers::set_state));
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
