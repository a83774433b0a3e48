use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stage that produced an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Identity,
    Ingest,
    Extract,
    Validate,
    Build,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Identity => "identity",
            Stage::Ingest => "ingest",
            Stage::Extract => "extract",
            Stage::Validate => "validate",
            Stage::Build => "build",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a build pipeline.
///
/// Every variant is owned by exactly one [`Stage`]; the `Display` output is the
/// human-readable cause that ends up in the HTTP response.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidIdentity(String),

    #[error("upload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("failed to write upload to disk: {0}")]
    IngestIo(#[source] std::io::Error),

    #[error("failed to read upload body: {0}")]
    MalformedUpload(#[source] std::io::Error),

    #[error("unable to extract archive: {0}")]
    CorruptArchive(String),

    /// `reason` carries the underlying read/parse error for logging only
    #[error("package.json could not be read.  Ensure it is in your upload.")]
    ManifestUnreadable { reason: String },

    #[error("scripts.start is required in package.json.")]
    ManifestMissingRunCommand,

    #[error("failed to package build context: {0}")]
    BuildContextError(String),

    #[error("{0}")]
    ImageBuildError(String),

    #[error("image {0} could not be found in the local image store")]
    ImageNotFound(String),

    #[error("{0}")]
    TagError(String),

    #[error("{0}")]
    PushError(String),

    #[error("{stage} stage did not finish within {secs}s")]
    StageTimeout { stage: Stage, secs: u64 },

    #[error("request was cancelled during the {stage} stage")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    /// Stage that detected this failure
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::InvalidIdentity(_) => Stage::Identity,
            PipelineError::PayloadTooLarge { .. }
            | PipelineError::IngestIo(_)
            | PipelineError::MalformedUpload(_) => Stage::Ingest,
            PipelineError::CorruptArchive(_) => Stage::Extract,
            PipelineError::ManifestUnreadable { .. } | PipelineError::ManifestMissingRunCommand => {
                Stage::Validate
            }
            PipelineError::BuildContextError(_) | PipelineError::ImageBuildError(_) => Stage::Build,
            PipelineError::ImageNotFound(_)
            | PipelineError::TagError(_)
            | PipelineError::PushError(_) => Stage::Publish,
            PipelineError::StageTimeout { stage, .. } | PipelineError::Cancelled { stage } => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_attribution() {
        assert_eq!(
            PipelineError::PayloadTooLarge { limit: 1 }.stage(),
            Stage::Ingest
        );
        assert_eq!(
            PipelineError::CorruptArchive("bad".into()).stage(),
            Stage::Extract
        );
        assert_eq!(PipelineError::ManifestMissingRunCommand.stage(), Stage::Validate);
        assert_eq!(
            PipelineError::ImageNotFound("a/b:1".into()).stage(),
            Stage::Publish
        );
        assert_eq!(
            PipelineError::StageTimeout {
                stage: Stage::Build,
                secs: 5
            }
            .stage(),
            Stage::Build
        );
    }

    #[test]
    fn test_manifest_messages_are_user_facing() {
        let unreadable = PipelineError::ManifestUnreadable {
            reason: "No such file or directory".into(),
        };
        assert_eq!(
            unreadable.to_string(),
            "package.json could not be read.  Ensure it is in your upload."
        );
        assert_eq!(
            PipelineError::ManifestMissingRunCommand.to_string(),
            "scripts.start is required in package.json."
        );
    }
}
