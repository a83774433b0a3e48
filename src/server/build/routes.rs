use super::handlers;
use crate::server::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, put},
    Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/buildnodejs/{org}/{env}/{app}",
            // Upload size is enforced while streaming to disk
            put(handlers::build_nodejs).layer(DefaultBodyLimit::disable()),
        )
        .route("/v1/images/{org}/{env}", get(handlers::list_images))
        .route("/v1/images/{org}/{env}/{app}", get(handlers::list_app_images))
}
