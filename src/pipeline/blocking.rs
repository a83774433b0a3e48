// Blocking filesystem work owned by one pipeline run

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Tracks the `spawn_blocking` tasks of a single run.
///
/// Dropping a stage future leaves its blocking closure running. Each closure
/// receives a token and stops at its next check once the token fires;
/// [`BlockingWork::drain`] waits until every closure has returned, so nothing
/// touches the working artifact after cleanup starts.
#[derive(Debug, Clone, Default)]
pub struct BlockingWork {
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl BlockingWork {
    /// Work that also stops when `parent` is cancelled
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            tasks: TaskTracker::new(),
            cancel: parent.child_token(),
        }
    }

    pub fn spawn<F, T>(&self, work: F) -> JoinHandle<T>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.spawn_blocking(move || work(cancel))
    }

    /// Stop outstanding work and wait for all of it to exit
    pub async fn drain(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
