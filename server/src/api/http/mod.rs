//! HTTP API handlers

mod gitspace;
mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Gitspace routes
        .route(
            "/gitspaces",
            post(gitspace::create_gitspace).get(gitspace::list_gitspaces),
        )
        .route(
            "/gitspaces/{id}",
            get(gitspace::get_gitspace).delete(gitspace::delete_gitspace),
        )
        .route("/gitspaces/{id}/actions", post(gitspace::gitspace_action))
        .route("/gitspaces/{id}/events", get(gitspace::list_events));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
