// Tag-and-push stage

use tracing::{error, info};

use super::error::PipelineError;
use super::identity::WorkingArtifact;
use crate::backend::{BackendError, ImageBackend, LogObserver};

/// Tag the local image with its registry-qualified name and push it.
///
/// `artifact.remote` is filled in as soon as tagging succeeds, so a failed push
/// still reports which remote tag was attempted.
pub async fn publish(
    artifact: &mut WorkingArtifact,
    registry_base: &str,
    backend: &dyn ImageBackend,
    observer: &dyn LogObserver,
) -> Result<(), PipelineError> {
    let local = artifact.container_tag.clone();

    match backend.inspect_image(&local).await {
        Ok(Some(id)) => info!(image = %local, id = %id, "Local image found"),
        Ok(None) => return Err(PipelineError::ImageNotFound(local)),
        Err(e) => {
            error!(image = %local, "Unable to inspect local image: {}", e);
            return Err(PipelineError::ImageNotFound(local));
        }
    }

    let remote = artifact.remote_for(registry_base);
    backend
        .tag_image(&local, &remote.tag)
        .await
        .map_err(|e| PipelineError::TagError(detail(e)))?;
    artifact.remote = Some(remote.clone());

    backend
        .push_image(&remote.tag, observer)
        .await
        .map_err(|e| PipelineError::PushError(detail(e)))?;

    info!(remote = %remote.tag, "Image pushed");
    Ok(())
}

fn detail(err: BackendError) -> String {
    match err {
        BackendError::Failed { detail, .. } if !detail.is_empty() => detail,
        other => other.to_string(),
    }
}
