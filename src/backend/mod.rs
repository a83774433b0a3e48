// Image build, tag and push backends

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;
pub mod proxy;

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub use docker::ContainerCli;

/// Failure reported by an image backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to the backend: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} provided no output stream")]
    NoOutput { command: String },

    #[error("{command} failed with {status}: {detail}")]
    Failed {
        command: String,
        status: String,
        detail: String,
    },

    #[error("unexpected backend response: {0}")]
    Protocol(String),
}

/// Receives build and push output one line at a time
pub trait LogObserver: Send + Sync {
    fn line(&self, line: &str);
}

/// Forwards backend output to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LogObserver for TracingObserver {
    fn line(&self, line: &str) {
        info!(target: "shipyard::backend", "{}", line);
    }
}

/// Local image as reported by the image store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub image_id: String,
    pub repository: String,
    pub tag: String,
    pub created: String,
    pub size: String,
}

/// Container engine operations the pipeline depends on
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Build the tar build context at `context` into a local image tagged `tag`
    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        observer: &dyn LogObserver,
    ) -> Result<(), BackendError>;

    /// Image ID for `reference`, or `None` when the image store has no such image
    async fn inspect_image(&self, reference: &str) -> Result<Option<String>, BackendError>;

    /// Add `target` as a name for `source`, returning the image ID it now refers to
    async fn tag_image(&self, source: &str, target: &str) -> Result<String, BackendError>;

    async fn push_image(
        &self,
        reference: &str,
        observer: &dyn LogObserver,
    ) -> Result<(), BackendError>;

    /// Local images carrying every `(label, value)` pair in `filters`
    async fn list_images(
        &self,
        filters: &[(&str, String)],
    ) -> Result<Vec<ImageSummary>, BackendError>;
}
