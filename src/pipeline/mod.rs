// Request-scoped build-and-publish pipeline

pub mod archive;
pub mod blocking;
pub mod builder;
pub mod cleanup;
pub mod context;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod publisher;
pub mod state_machine;

use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ImageBackend, LogObserver};
use blocking::BlockingWork;
use context::DescriptorTemplate;
use state_machine::{PipelineState, StateTracker};

pub use error::{PipelineError, Stage};
pub use identity::{DeploymentRequest, RemoteImage, WorkingArtifact};

/// Terminal result of one run; on success the artifact carries its remote names
pub type BuildOutcome = Result<WorkingArtifact, PipelineError>;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent of every per-request working directory
    pub tmp_dir: PathBuf,
    pub registry_base: String,
    /// Budget for the uncompressed contents of one bundle
    pub max_extracted_bytes: u64,
    /// Upper bound for each of the build and publish stages
    pub stage_timeout: Duration,
    pub descriptor: DescriptorTemplate,
}

/// Runs uploads through ingest, extract, validate, build and publish.
///
/// Holds nothing mutable: each [`Pipeline::run`] owns its own working artifact,
/// so any number of runs may proceed concurrently.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    backend: Arc<dyn ImageBackend>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, backend: Arc<dyn ImageBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one request to its terminal outcome, then clean up.
    ///
    /// Cleanup happens inside this future, after the outcome is known. Callers
    /// that may drop the future early (client disconnects) should spawn it and
    /// signal `cancel` instead.
    pub async fn run<S, E>(
        &self,
        request: DeploymentRequest,
        body: S,
        observer: &dyn LogObserver,
        cancel: CancellationToken,
    ) -> BuildOutcome
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        // Nothing exists on disk until ingest starts, so an invalid identity needs no cleanup
        let mut artifact = WorkingArtifact::derive(&request, &self.config.tmp_dir)?;
        let tracker = StateTracker::default();
        let work = BlockingWork::child_of(&cancel);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled {
                stage: tracker.current().stage(),
            }),
            result = self.execute(&request, &mut artifact, body, observer, &tracker, &work) => result,
        };

        // A stage dropped by cancellation or timeout may still have blocking
        // filesystem work writing into the artifact paths
        work.drain().await;

        match &result {
            Ok(()) => tracker.advance(PipelineState::Done),
            Err(e) => tracker.advance(PipelineState::Failed(e.stage())),
        }

        let report = cleanup::cleanup(&artifact).await;
        if !report.is_clean() {
            warn!(
                failed = report.failed.len(),
                "Some build artifacts could not be removed"
            );
        }

        match result {
            Ok(()) => {
                info!(
                    container = %artifact.container_tag,
                    state = %tracker.current(),
                    "Pipeline finished"
                );
                Ok(artifact)
            }
            Err(e) => {
                warn!(stage = %e.stage(), state = %tracker.current(), "Pipeline failed: {}", e);
                Err(e)
            }
        }
    }

    async fn execute<S, E>(
        &self,
        request: &DeploymentRequest,
        artifact: &mut WorkingArtifact,
        body: S,
        observer: &dyn LogObserver,
        tracker: &StateTracker,
        work: &BlockingWork,
    ) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        tracker.advance(PipelineState::Ingesting);
        let bytes = ingest::ingest(body, &artifact.archive_path, request.max_upload_bytes).await?;
        info!(bytes, "Upload received");

        tracker.advance(PipelineState::Extracting);
        archive::extract(
            &artifact.archive_path,
            &artifact.working_dir,
            self.config.max_extracted_bytes,
            work,
        )
        .await?;

        tracker.advance(PipelineState::Validating);
        archive::validate(&artifact.working_dir).await?;

        tracker.advance(PipelineState::Building);
        let backend = self.backend.as_ref();
        self.with_timeout(
            Stage::Build,
            builder::build(artifact, &self.config.descriptor, backend, observer, work),
        )
        .await?;

        tracker.advance(PipelineState::Publishing);
        self.with_timeout(
            Stage::Publish,
            publisher::publish(artifact, &self.config.registry_base, backend, observer),
        )
        .await
    }

    async fn with_timeout<T>(
        &self,
        stage: Stage,
        stage_future: impl Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        match tokio::time::timeout(self.config.stage_timeout, stage_future).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::StageTimeout {
                stage,
                secs: self.config.stage_timeout.as_secs(),
            }),
        }
    }
}
