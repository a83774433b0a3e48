use super::models::{BuildResponse, REVISION_HEADER};
use crate::backend::{ImageSummary, TracingObserver};
use crate::pipeline::identity::ImageLabels;
use crate::pipeline::DeploymentRequest;
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::middleware::RequestId;
use crate::server::state::AppState;
use axum::{
    body::Body,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

/// Build the uploaded bundle into an image and push it to the registry
pub async fn build_nodejs(
    State(state): State<AppState>,
    Path((org, env, app)): Path<(String, String, String)>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<BuildResponse>, ServerError> {
    let revision = headers
        .get(REVISION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ServerError::bad_request(format!(
                "You must specify a version in {} header",
                REVISION_HEADER
            ))
        })?
        .to_string();

    let request = DeploymentRequest::new(
        org,
        env,
        app,
        revision,
        state.settings.pipeline.max_upload_bytes,
    );
    request.validate()?;

    let permit = match &state.build_slots {
        Some(slots) => Some(slots.clone().try_acquire_owned().map_err(|_| {
            ServerError::service_unavailable("Too many builds in progress, try again later")
        })?),
        None => None,
    };

    let span = info_span!(
        "build",
        request_id = %request_id.0,
        org = %request.org,
        env = %request.env,
        app = %request.app,
        revision = %request.revision,
    );
    let revision = request.revision.clone();
    let app = request.app.clone();

    // Dropping this handler cancels the pipeline; cleanup still runs in the task
    let cancel = CancellationToken::new();
    let disconnect_guard = cancel.clone().drop_guard();
    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(
        async move {
            let _permit = permit;
            info!("Build started");
            pipeline
                .run(request, body.into_data_stream(), &TracingObserver, cancel)
                .await
        }
        .instrument(span),
    );

    let outcome = task.await.internal_err("Build task failed")?;
    disconnect_guard.disarm();

    let artifact = outcome.map_err(|e| {
        ServerError::from(e)
            .with_context("app", app)
            .with_context("revision", revision)
    })?;

    let container_id = match artifact.remote {
        Some(remote) => remote.tag,
        None => artifact.container_tag,
    };

    Ok(Json(BuildResponse {
        endpoint: state.settings.server.endpoint.clone(),
        container_id,
    }))
}

/// List images built for an environment
pub async fn list_images(
    State(state): State<AppState>,
    Path((org, env)): Path<(String, String)>,
) -> Result<Json<Vec<ImageSummary>>, ServerError> {
    find_images(&state, ImageLabels::filters(&org, &env, None)).await
}

/// List images built for one application
pub async fn list_app_images(
    State(state): State<AppState>,
    Path((org, env, app)): Path<(String, String, String)>,
) -> Result<Json<Vec<ImageSummary>>, ServerError> {
    find_images(&state, ImageLabels::filters(&org, &env, Some(&app))).await
}

async fn find_images(
    state: &AppState,
    filters: Vec<(&'static str, String)>,
) -> Result<Json<Vec<ImageSummary>>, ServerError> {
    let images = state
        .backend
        .list_images(&filters)
        .await
        .server_err(StatusCode::BAD_GATEWAY, "Unable to list docker images")?;
    Ok(Json(images))
}
