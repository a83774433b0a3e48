// Request identity and per-request working paths

use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::error::PipelineError;

/// Label keys written into every generated build descriptor
pub const LABEL_REPO: &str = "com.github.30x.shipyard.repo";
pub const LABEL_APPLICATION: &str = "com.github.30x.shipyard.app";
pub const LABEL_REVISION: &str = "com.github.30x.shipyard.revision";

/// A single build-and-publish request
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub org: String,
    pub env: String,
    pub app: String,
    pub revision: String,
    pub max_upload_bytes: u64,
}

impl DeploymentRequest {
    pub fn new(
        org: impl Into<String>,
        env: impl Into<String>,
        app: impl Into<String>,
        revision: impl Into<String>,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            org: org.into(),
            env: env.into(),
            app: app.into(),
            revision: revision.into(),
            max_upload_bytes,
        }
    }

    /// Reject identities that cannot produce a safe working directory or a valid tag
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (field, value) in [("org", &self.org), ("env", &self.env), ("app", &self.app)] {
            validate_component(field, value)?;
            if !is_repository_component(value) {
                return Err(PipelineError::InvalidIdentity(format!(
                    "{} '{}' is not valid in an image name",
                    field, value
                )));
            }
        }
        validate_component("revision", &self.revision)?;

        // Docker tag grammar: [A-Za-z0-9_][A-Za-z0-9_.-]*
        let valid_tag = self
            .revision
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            && !self.revision.starts_with(['.', '-']);
        if !valid_tag {
            return Err(PipelineError::InvalidIdentity(format!(
                "revision '{}' is not a valid image tag",
                self.revision
            )));
        }

        Ok(())
    }
}

fn validate_component(field: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::InvalidIdentity(format!(
            "You must specify an {} name",
            field
        )));
    }
    if value.contains(['/', '\\', '\0']) || value.contains("..") {
        return Err(PipelineError::InvalidIdentity(format!(
            "{} '{}' contains a path separator",
            field, value
        )));
    }
    Ok(())
}

/// Docker repository path component: alphanumerics joined by `.`, `_`, `__` or
/// runs of `-`. Case is accepted here since names are lowercased on derive.
fn is_repository_component(value: &str) -> bool {
    let bytes = value.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last))
            if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() => {}
        _ => return false,
    }

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_alphanumeric() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !bytes[i].is_ascii_alphanumeric() {
            i += 1;
        }
        let separator = &bytes[start..i];
        let allowed =
            matches!(separator, b"." | b"_" | b"__") || separator.iter().all(|&c| c == b'-');
        if !allowed {
            return false;
        }
    }
    true
}

/// Labels identifying an image built by this service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLabels {
    pub repo: String,
    pub app: String,
    pub revision: String,
}

impl ImageLabels {
    pub fn new(org: &str, env: &str, app: &str, revision: &str) -> Self {
        Self {
            repo: repository_name(org, env),
            app: app.to_lowercase(),
            revision: revision.to_string(),
        }
    }

    /// Label filters for listing images; `app` narrows the search when given
    pub fn filters(org: &str, env: &str, app: Option<&str>) -> Vec<(&'static str, String)> {
        let mut filters = vec![(LABEL_REPO, repository_name(org, env))];
        if let Some(app) = app {
            filters.push((LABEL_APPLICATION, app.to_lowercase()));
        }
        filters
    }

    pub fn as_pairs(&self) -> [(&'static str, &str); 3] {
        [
            (LABEL_REPO, self.repo.as_str()),
            (LABEL_APPLICATION, self.app.as_str()),
            (LABEL_REVISION, self.revision.as_str()),
        ]
    }
}

fn repository_name(org: &str, env: &str) -> String {
    format!("{}_{}", org, env).to_lowercase()
}

/// Remote-qualified image names, known once the local image has been tagged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    /// `{registry}/{container_name}`
    pub container: String,
    /// `{registry}/{container_name}:{revision}`
    pub tag: String,
}

/// Filesystem paths and image names owned by one pipeline run
#[derive(Debug, Clone)]
pub struct WorkingArtifact {
    pub working_dir: PathBuf,
    pub archive_path: PathBuf,
    pub tar_path: PathBuf,
    pub container_name: String,
    pub container_tag: String,
    pub revision: String,
    pub labels: ImageLabels,
    pub remote: Option<RemoteImage>,
}

impl WorkingArtifact {
    /// Derive all paths for `request` below `tmp_dir` without touching the filesystem.
    ///
    /// A fresh UUIDv7 suffix keeps duplicate submissions of the same revision apart
    /// on disk even though they share a container tag.
    pub fn derive(request: &DeploymentRequest, tmp_dir: &Path) -> Result<Self, PipelineError> {
        request.validate()?;

        let dir_name = format!(
            "{}_{}_{}_{}_{}",
            request.org,
            request.env,
            request.app,
            request.revision,
            Uuid::now_v7()
        );
        let working_dir = tmp_dir.join(&dir_name);
        let archive_path = tmp_dir.join(format!("{}.zip", dir_name));
        let tar_path = tmp_dir.join(format!("{}.tar", dir_name));

        let container_name = format!("{}/{}", repository_name(&request.org, &request.env), request.app)
            .to_lowercase();
        let container_tag = format!("{}:{}", container_name, request.revision);

        Ok(Self {
            working_dir,
            archive_path,
            tar_path,
            container_name,
            container_tag,
            revision: request.revision.clone(),
            labels: ImageLabels::new(&request.org, &request.env, &request.app, &request.revision),
            remote: None,
        })
    }

    /// Compute the remote names for this artifact under `registry_base`
    pub fn remote_for(&self, registry_base: &str) -> RemoteImage {
        let registry = normalize_registry(registry_base);
        let container = format!("{}/{}", registry, self.container_name);
        let tag = format!("{}:{}", container, self.revision);
        RemoteImage { container, tag }
    }
}

/// Strip scheme and trailing slashes; image references carry neither
pub fn normalize_registry(registry_base: &str) -> &str {
    registry_base
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
}
