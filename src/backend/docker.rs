// Docker/Podman CLI backend

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, info, warn};

use super::{BackendError, ImageBackend, ImageSummary, LogObserver};

/// Lines of command output kept for error messages
const OUTPUT_TAIL_LINES: usize = 20;

const IMAGE_LIST_FORMAT: &str =
    "{{.ID}}\t{{.Repository}}\t{{.Tag}}\t{{.CreatedAt}}\t{{.Size}}";

/// Image backend driving a `docker`-compatible CLI
#[derive(Debug, Clone)]
pub struct ContainerCli {
    program: String,
    platform: Option<String>,
    build_args: BTreeMap<String, String>,
}

impl ContainerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            platform: None,
            build_args: BTreeMap::new(),
        }
    }

    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_build_args(mut self, build_args: BTreeMap<String, String>) -> Self {
        self.build_args = build_args;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Make sure the CLI can be executed, returning its version line
    pub async fn check_available(&self) -> Result<String, BackendError> {
        let output = self.output(&["--version"]).await?;
        if !output.status.success() {
            return Err(failure(&self.label("--version"), &output));
        }
        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        info!("Using container CLI: {}", version);
        Ok(version)
    }

    fn label(&self, subcommand: &str) -> String {
        format!("{} {}", self.program, subcommand)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        // A dropped pipeline future (timeout or disconnect) must take the child with it
        cmd.kill_on_drop(true);
        cmd
    }

    fn build_command(&self, tag: &str) -> Command {
        let mut cmd = self.command();
        cmd.arg("build").arg("-t").arg(tag);
        if let Some(platform) = &self.platform {
            cmd.arg("--platform").arg(platform);
        }
        for (key, value) in &self.build_args {
            cmd.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        // Build context is read from stdin
        cmd.arg("-");
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<Output, BackendError> {
        let mut cmd = self.command();
        cmd.args(args).stdin(Stdio::null());
        debug!("Executing command: {:?}", cmd);
        cmd.output().await.map_err(|source| BackendError::Spawn {
            command: self.label(args.first().copied().unwrap_or_default()),
            source,
        })
    }
}

#[async_trait]
impl ImageBackend for ContainerCli {
    fn name(&self) -> &str {
        &self.program
    }

    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        observer: &dyn LogObserver,
    ) -> Result<(), BackendError> {
        info!("Building image with {}: {}", self.program, tag);
        run_streaming(self.build_command(tag), &self.label("build"), Some(context), observer).await
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<String>, BackendError> {
        let output = self
            .output(&["image", "inspect", "--format", "{{.Id}}", reference])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image(&stderr) {
                return Ok(None);
            }
            return Err(failure(&self.label("image inspect"), &output));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<String, BackendError> {
        info!("Tagging image {} as {}", source, target);
        let output = self.output(&["tag", source, target]).await?;
        if !output.status.success() {
            return Err(failure(&self.label("tag"), &output));
        }

        // The CLI prints nothing on success; the new name must now resolve
        self.inspect_image(target).await?.ok_or_else(|| {
            BackendError::Protocol(format!("tag {} did not resolve to an image", target))
        })
    }

    async fn push_image(
        &self,
        reference: &str,
        observer: &dyn LogObserver,
    ) -> Result<(), BackendError> {
        info!("Pushing image to registry: {}", reference);
        let mut cmd = self.command();
        cmd.arg("push").arg(reference);
        run_streaming(cmd, &self.label("push"), None, observer).await
    }

    async fn list_images(
        &self,
        filters: &[(&str, String)],
    ) -> Result<Vec<ImageSummary>, BackendError> {
        let mut args: Vec<String> = vec!["images".into(), "--no-trunc".into()];
        for (label, value) in filters {
            args.push("--filter".into());
            args.push(format!("label={}={}", label, value));
        }
        args.push("--format".into());
        args.push(IMAGE_LIST_FORMAT.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.output(&arg_refs).await?;
        if !output.status.success() {
            return Err(failure(&self.label("images"), &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let parsed = parse_image_line(line);
                if parsed.is_none() {
                    warn!("Skipping unparsable image listing line: {}", line);
                }
                parsed
            })
            .collect())
    }
}

/// Run `cmd`, optionally feeding `stdin_from` into it, forwarding every output line
async fn run_streaming(
    mut cmd: Command,
    label: &str,
    stdin_from: Option<&Path>,
    observer: &dyn LogObserver,
) -> Result<(), BackendError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin_from.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    debug!("Executing command: {:?}", cmd);

    let mut child = cmd.spawn().map_err(|source| BackendError::Spawn {
        command: label.to_string(),
        source,
    })?;

    let no_output = || BackendError::NoOutput {
        command: label.to_string(),
    };
    let stdout = child.stdout.take().ok_or_else(no_output)?;
    let stderr = child.stderr.take().ok_or_else(no_output)?;
    let stdin = match stdin_from {
        Some(path) => Some((
            path,
            child
                .stdin
                .take()
                .ok_or_else(|| BackendError::Protocol(format!("{} stdin not captured", label)))?,
        )),
        None => None,
    };

    let feed = async {
        match stdin {
            Some((path, pipe)) => feed_stdin(path, pipe).await,
            None => Ok(()),
        }
    };
    let (fed, tail) = tokio::join!(feed, forward_output(stdout, stderr, observer));
    let tail = tail?;
    let status = child.wait().await?;

    if !status.success() {
        return Err(BackendError::Failed {
            command: label.to_string(),
            status: status.to_string(),
            detail: tail.joined(),
        });
    }
    fed?;
    Ok(())
}

async fn feed_stdin(path: &Path, mut pipe: ChildStdin) -> Result<(), BackendError> {
    let mut file = tokio::fs::File::open(path).await?;
    match tokio::io::copy(&mut file, &mut pipe).await {
        Ok(bytes) => {
            debug!(bytes, "Build context sent");
            Ok(())
        }
        // The child exited early; its exit status carries the real error
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn forward_output<O, E>(
    stdout: O,
    stderr: E,
    observer: &dyn LogObserver,
) -> io::Result<OutputTail>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    // Split on raw bytes; build output echoes whatever the bundle prints
    let mut out = BufReader::new(stdout).split(b'\n');
    let mut err = BufReader::new(stderr).split(b'\n');
    let mut tail = OutputTail::new(OUTPUT_TAIL_LINES);
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        let segment = tokio::select! {
            segment = out.next_segment(), if out_open => {
                let segment = segment?;
                out_open = segment.is_some();
                segment
            }
            segment = err.next_segment(), if err_open => {
                let segment = segment?;
                err_open = segment.is_some();
                segment
            }
        };
        if let Some(segment) = segment {
            let line = decode_line(&segment);
            observer.line(&line);
            tail.push(line);
        }
    }

    Ok(tail)
}

fn decode_line(segment: &[u8]) -> String {
    let segment = segment.strip_suffix(b"\r").unwrap_or(segment);
    String::from_utf8_lossy(segment).into_owned()
}

/// Last few lines of a command's output
#[derive(Debug)]
struct OutputTail {
    capacity: usize,
    lines: VecDeque<String>,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, line: String) {
        if line.trim().is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn failure(command: &str, output: &Output) -> BackendError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let detail = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    BackendError::Failed {
        command: command.to_string(),
        status: output.status.to_string(),
        detail,
    }
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ["no such", "not known", "not found"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn parse_image_line(line: &str) -> Option<ImageSummary> {
    let mut fields = line.split('\t').map(str::trim);
    let summary = ImageSummary {
        image_id: fields.next()?.to_string(),
        repository: fields.next()?.to_string(),
        tag: fields.next()?.to_string(),
        created: fields.next()?.to_string(),
        size: fields.next()?.to_string(),
    };
    if fields.next().is_some() || summary.image_id.is_empty() {
        return None;
    }
    Some(summary)
}
