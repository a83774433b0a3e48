// In-memory image backend for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::{BackendError, ImageBackend, ImageSummary, LogObserver};

/// Operation a [`FakeBackend`] should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    Build,
    Tag,
    Push,
}

#[derive(Debug, Default)]
struct FakeState {
    /// reference -> image id
    images: HashMap<String, String>,
    contexts_seen: Vec<PathBuf>,
    pushed: Vec<String>,
    filters_seen: Vec<Vec<(String, String)>>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    fail_at: Option<FailAt>,
    build_delay: Option<Duration>,
    push_delay: Option<Duration>,
    forget_builds: bool,
    listed: Vec<ImageSummary>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_at(mut self, stage: FailAt) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Sleep this long inside build and push
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self.push_delay = Some(delay);
        self
    }

    /// Sleep this long inside push only
    pub(crate) fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = Some(delay);
        self
    }

    /// Report builds as successful without storing the image
    pub(crate) fn forgetting_builds(mut self) -> Self {
        self.forget_builds = true;
        self
    }

    pub(crate) fn with_listing(mut self, images: Vec<ImageSummary>) -> Self {
        self.listed = images;
        self
    }

    pub(crate) fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub(crate) fn contexts_seen(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().contexts_seen.clone()
    }

    /// Label filters of every `list_images` call, in order
    pub(crate) fn filters_seen(&self) -> Vec<Vec<(String, String)>> {
        self.state.lock().unwrap().filters_seen.clone()
    }

    async fn pause(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn fail(&self, stage: FailAt, command: &str) -> Result<(), BackendError> {
        if self.fail_at == Some(stage) {
            return Err(BackendError::Failed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                detail: format!("{} exploded", command),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        observer: &dyn LogObserver,
    ) -> Result<(), BackendError> {
        // the context has to exist while the backend reads it
        let bytes = tokio::fs::metadata(context).await?.len();
        self.state
            .lock()
            .unwrap()
            .contexts_seen
            .push(context.to_path_buf());

        observer.line(&format!("Sending build context ({} bytes)", bytes));
        Self::pause(self.build_delay).await;
        self.fail(FailAt::Build, "fake build")?;

        if !self.forget_builds {
            let id = format!("sha256:{:x}", bytes);
            self.state
                .lock()
                .unwrap()
                .images
                .insert(tag.to_string(), id);
        }
        observer.line(&format!("Successfully tagged {}", tag));
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<String>, BackendError> {
        Ok(self.state.lock().unwrap().images.get(reference).cloned())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<String, BackendError> {
        self.fail(FailAt::Tag, "fake tag")?;
        let mut state = self.state.lock().unwrap();
        let id = state
            .images
            .get(source)
            .cloned()
            .ok_or_else(|| BackendError::Protocol(format!("no image {}", source)))?;
        state.images.insert(target.to_string(), id.clone());
        Ok(id)
    }

    async fn push_image(
        &self,
        reference: &str,
        observer: &dyn LogObserver,
    ) -> Result<(), BackendError> {
        observer.line(&format!("The push refers to repository [{}]", reference));
        Self::pause(self.push_delay).await;
        self.fail(FailAt::Push, "fake push")?;
        self.state.lock().unwrap().pushed.push(reference.to_string());
        Ok(())
    }

    async fn list_images(
        &self,
        filters: &[(&str, String)],
    ) -> Result<Vec<ImageSummary>, BackendError> {
        let filters = filters
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        self.state.lock().unwrap().filters_seen.push(filters);
        Ok(self.listed.clone())
    }
}

/// Observer that remembers every line
#[derive(Debug, Default)]
pub(crate) struct CollectingObserver {
    lines: Mutex<Vec<String>>,
}

impl CollectingObserver {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogObserver for CollectingObserver {
    fn line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}
