// Build descriptor generation and build context packaging

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::blocking::BlockingWork;
use super::error::PipelineError;
use super::identity::ImageLabels;

pub const BUILD_DESCRIPTOR: &str = "Dockerfile";

/// Inputs for the generated Dockerfile
#[derive(Debug, Clone)]
pub struct DescriptorTemplate {
    pub base_image: String,
    pub exposed_port: u16,
}

impl DescriptorTemplate {
    pub fn render(&self, labels: &ImageLabels) -> String {
        let mut out = String::new();
        out.push_str(&format!("FROM {}\n\n", self.base_image));
        out.push_str("WORKDIR /app\n");
        out.push_str("COPY . /app\n");
        out.push_str("RUN npm install --production\n\n");
        out.push_str(&format!("EXPOSE {}\n\n", self.exposed_port));
        for (key, value) in labels.as_pairs() {
            out.push_str(&format!("LABEL {}=\"{}\"\n", key, value.replace('"', "\\\"")));
        }
        out.push_str("\nCMD [\"npm\", \"start\"]\n");
        out
    }
}

/// Write the generated Dockerfile unless the bundle ships its own.
///
/// Returns `true` when a descriptor was written.
pub async fn ensure_build_descriptor(
    working_dir: &Path,
    template: &DescriptorTemplate,
    labels: &ImageLabels,
) -> Result<bool, PipelineError> {
    let path = working_dir.join(BUILD_DESCRIPTOR);
    let exists = tokio::fs::try_exists(&path)
        .await
        .map_err(|e| PipelineError::BuildContextError(e.to_string()))?;
    if exists {
        info!("Bundle provides its own {}, keeping it", BUILD_DESCRIPTOR);
        return Ok(false);
    }

    tokio::fs::write(&path, template.render(labels))
        .await
        .map_err(|e| {
            PipelineError::BuildContextError(format!("writing {}: {}", BUILD_DESCRIPTOR, e))
        })?;
    debug!(path = %path.display(), "Generated build descriptor");
    Ok(true)
}

/// Package `working_dir` as an uncompressed tar build context at `tar_path`
pub async fn package(
    working_dir: &Path,
    tar_path: &Path,
    work: &BlockingWork,
) -> Result<u64, PipelineError> {
    let working_dir = working_dir.to_owned();
    let tar_path = tar_path.to_owned();

    work.spawn(move |cancel| write_context(&working_dir, &tar_path, cancel))
        .await
        .map_err(|e| PipelineError::BuildContextError(format!("packaging task failed: {}", e)))?
        .map_err(|e| PipelineError::BuildContextError(e.to_string()))
}

fn write_context(
    working_dir: &Path,
    tar_path: &Path,
    cancel: CancellationToken,
) -> io::Result<u64> {
    let output = CancellableWriter {
        inner: BufWriter::new(File::create(tar_path)?),
        cancel,
    };
    let mut builder = tar::Builder::new(output);
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.append_dir_all(".", working_dir)?;

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    drop(writer);

    Ok(std::fs::metadata(tar_path)?.len())
}

/// Fails every write once `cancel` fires, which aborts the tar builder mid-walk
struct CancellableWriter<W> {
    inner: W,
    cancel: CancellationToken,
}

impl<W: Write> Write for CancellableWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("build context packaging cancelled"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
