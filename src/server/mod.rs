pub mod build;
pub mod error;
pub mod middleware;
pub mod settings;
pub mod state;

use anyhow::Result;
use axum::{routing::get, Json, Router};
use state::AppState;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Run the HTTP server until SIGINT/SIGTERM
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    let state = AppState::new_for_server(&settings).await?;

    info!(
        backend = state.backend.name(),
        registry = %settings.registry.url,
        tmp_dir = %settings.pipeline.tmp_dir().display(),
        max_upload_bytes = settings.pipeline.max_upload_bytes,
        max_concurrent_builds = settings.pipeline.max_concurrent_builds,
        "Build service configured"
    );

    let app = build_router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("HTTP server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// All routes with request IDs and request tracing applied
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/version", get(version_info))
        .route("/v1/heartbeat", get(heartbeat))
        .merge(build::routes::routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(
                    middleware::request_id_middleware,
                ))
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health_check() -> &'static str {
    "OK"
}

async fn version_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn heartbeat() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::server::settings::{RegistrySettings, Settings};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt; // for `oneshot`

    fn router() -> Router {
        let settings = Settings {
            server: Default::default(),
            pipeline: Default::default(),
            backend: Default::default(),
            registry: RegistrySettings {
                url: "localhost:5000".into(),
            },
        };
        build_router(AppState::with_backend(settings, Arc::new(FakeBackend::new())))
    }

    async fn get_body(uri: &str) -> (StatusCode, axum::body::Bytes) {
        let response = router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let (status, body) = get_body("/v1/heartbeat").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, body) = get_body("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_version_info() {
        let (_, body) = get_body("/version").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (status, _) = get_body("/v1/nothing-here").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
