// Image build stage

use tracing::{error, info};

use super::blocking::BlockingWork;
use super::context::{ensure_build_descriptor, package, DescriptorTemplate};
use super::error::PipelineError;
use super::identity::WorkingArtifact;
use crate::backend::{BackendError, ImageBackend, LogObserver};

/// Write the build descriptor, package the context and build `container_tag`
pub async fn build(
    artifact: &WorkingArtifact,
    template: &DescriptorTemplate,
    backend: &dyn ImageBackend,
    observer: &dyn LogObserver,
    work: &BlockingWork,
) -> Result<(), PipelineError> {
    ensure_build_descriptor(&artifact.working_dir, template, &artifact.labels).await?;

    let context_bytes = package(&artifact.working_dir, &artifact.tar_path, work).await?;
    info!(
        tag = %artifact.container_tag,
        context_bytes,
        backend = backend.name(),
        "Build context packaged"
    );

    backend
        .build_image(&artifact.tar_path, &artifact.container_tag, observer)
        .await
        .map_err(|e| {
            error!(tag = %artifact.container_tag, "Image build failed: {}", e);
            build_error(e)
        })?;

    info!(tag = %artifact.container_tag, "Image built");
    Ok(())
}

fn build_error(err: BackendError) -> PipelineError {
    match err {
        BackendError::Failed { detail, .. } if !detail.is_empty() => {
            PipelineError::ImageBuildError(detail)
        }
        other => PipelineError::ImageBuildError(other.to_string()),
    }
}
