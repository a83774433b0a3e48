// Bundle extraction and package manifest validation

use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::ZipArchive;

use super::blocking::BlockingWork;
use super::error::{PipelineError, Stage};

pub const MANIFEST_FILE: &str = "package.json";

const COPY_CHUNK: usize = 64 * 1024;

/// Subset of `package.json` the service depends on
#[derive(Debug, Clone, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scripts: Option<Scripts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scripts {
    #[serde(default)]
    pub start: Option<String>,
}

impl PackageManifest {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let manifest: PackageManifest =
            serde_json::from_str(raw).map_err(|e| PipelineError::ManifestUnreadable {
                reason: e.to_string(),
            })?;

        if manifest.start_command().is_none() {
            return Err(PipelineError::ManifestMissingRunCommand);
        }
        Ok(manifest)
    }

    /// The declared `scripts.start` command, if non-blank
    pub fn start_command(&self) -> Option<&str> {
        self.scripts
            .as_ref()
            .and_then(|s| s.start.as_deref())
            .filter(|cmd| !cmd.trim().is_empty())
    }
}

/// Unpack the zip at `archive_path` into `target`, returning the number of entries written.
///
/// The uncompressed contents may total at most `max_bytes`.
pub async fn extract(
    archive_path: &Path,
    target: &Path,
    max_bytes: u64,
    work: &BlockingWork,
) -> Result<usize, PipelineError> {
    let archive_path = archive_path.to_owned();
    let target = target.to_owned();

    work.spawn(move |cancel| extract_zip(&archive_path, &target, max_bytes, &cancel))
        .await
        .map_err(|e| PipelineError::CorruptArchive(format!("extraction task failed: {}", e)))?
}

fn extract_zip(
    archive_path: &Path,
    target: &Path,
    max_bytes: u64,
    cancel: &CancellationToken,
) -> Result<usize, PipelineError> {
    let corrupt = |e: &dyn std::fmt::Display| PipelineError::CorruptArchive(e.to_string());

    let file = File::open(archive_path).map_err(|e| corrupt(&e))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(&e))?;

    fs::create_dir_all(target).map_err(|e| corrupt(&e))?;

    let mut remaining = max_bytes;
    let mut buf = vec![0u8; COPY_CHUNK];
    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: Stage::Extract,
            });
        }
        let mut entry = archive.by_index(index).map_err(|e| corrupt(&e))?;

        // enclosed_name is None for absolute paths and anything climbing out via `..`
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(PipelineError::CorruptArchive(format!(
                    "entry '{}' escapes the extraction directory",
                    entry.name()
                )))
            }
        };
        let destination = target.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&destination).map_err(|e| corrupt(&e))?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| corrupt(&e))?;
        }
        let mut output = File::create(&destination).map_err(|e| corrupt(&e))?;

        // One byte past the budget is enough to tell an oversized bundle apart
        let mut limited = (&mut entry).take(remaining.saturating_add(1));
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: Stage::Extract,
                });
            }
            let n = limited.read(&mut buf).map_err(|e| {
                PipelineError::CorruptArchive(format!("{}: {}", relative.display(), e))
            })?;
            if n == 0 {
                break;
            }
            if n as u64 > remaining {
                return Err(PipelineError::CorruptArchive(format!(
                    "archive expands beyond {} bytes",
                    max_bytes
                )));
            }
            remaining -= n as u64;
            output.write_all(&buf[..n]).map_err(|e| corrupt(&e))?;
        }

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&destination, fs::Permissions::from_mode(mode & 0o777))
                .map_err(|e| corrupt(&e))?;
        }
    }

    debug!(
        entries = archive.len(),
        bytes = max_bytes - remaining,
        target = %target.display(),
        "Archive extracted"
    );
    Ok(archive.len())
}

/// Read and check `package.json` in the extracted bundle. Never executes anything.
pub async fn validate(working_dir: &Path) -> Result<PackageManifest, PipelineError> {
    let path = working_dir.join(MANIFEST_FILE);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| PipelineError::ManifestUnreadable {
            reason: e.to_string(),
        })?;

    let manifest = PackageManifest::parse(&raw)?;
    info!(
        package = manifest.name.as_deref().unwrap_or("<unnamed>"),
        start = manifest.start_command().unwrap_or_default(),
        "Package manifest validated"
    );
    Ok(manifest)
}
