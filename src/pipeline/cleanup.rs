// Removal of every filesystem artifact a pipeline run may have created

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::identity::WorkingArtifact;

/// What a cleanup pass did; failures have already been logged
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remove the archive, the build context and the working directory.
///
/// Each removal is attempted independently and missing paths are not errors, so
/// calling this again on the same artifact is a no-op.
pub async fn cleanup(artifact: &WorkingArtifact) -> CleanupReport {
    let mut report = CleanupReport::default();

    for path in [&artifact.archive_path, &artifact.tar_path] {
        record(&mut report, path, remove_file(path).await);
    }
    record(
        &mut report,
        &artifact.working_dir,
        remove_dir(&artifact.working_dir).await,
    );

    debug!(
        removed = report.removed.len(),
        failed = report.failed.len(),
        "Cleanup finished"
    );
    report
}

fn record(report: &mut CleanupReport, path: &Path, result: io::Result<bool>) {
    match result {
        Ok(true) => report.removed.push(path.to_path_buf()),
        Ok(false) => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to remove build artifact");
            report.failed.push(path.to_path_buf());
        }
    }
}

async fn remove_file(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn remove_dir(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
