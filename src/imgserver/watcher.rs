use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::sandbox::SandboxRunner;
use crate::store::{JobStatus, MetadataStore};

/// Poll interval against the sandbox runner.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Registry of in-flight completion watchers, keyed by request id.
///
/// One watcher is spawned per launched job, fire-and-forget: no caller
/// awaits it, nothing restarts it after a process crash. Keeping the task
/// handles in a map makes pending watchers inspectable without changing
/// that externally observable behavior; finished entries are reaped on
/// every access.
#[derive(Default)]
pub struct WatcherSet {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watchers still pending.
    pub async fn len(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        Self::reap(&mut tasks);
        tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a watcher for `request_id` is still pending.
    pub async fn watching(&self, request_id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        Self::reap(&mut tasks);
        tasks.contains_key(request_id)
    }

    /// Spawn the completion watcher for one launched job.
    ///
    /// Polls the runner until the sandbox stops, flips the stored record to
    /// `done`, then removes the sandbox best-effort.
    pub async fn spawn(
        &self,
        request_id: String,
        handle: String,
        store: Arc<dyn MetadataStore>,
        runner: Arc<dyn SandboxRunner>,
    ) {
        let id = request_id.clone();
        let task = tokio::spawn(async move {
            watch_job(&request_id, &handle, store, runner).await;
        });

        let mut tasks = self.tasks.lock().await;
        Self::reap(&mut tasks);
        tasks.insert(id, task);
    }

    fn reap(tasks: &mut HashMap<String, JoinHandle<()>>) {
        tasks.retain(|_, task| !task.is_finished());
    }
}

/// Poll until the sandbox stops, then mark the job done and reclaim the
/// sandbox. A poll failure stops the watcher without flipping the status:
/// the job stays `processing`, which callers see as a stuck job. Removal
/// failures are swallowed either way.
async fn watch_job(
    request_id: &str,
    handle: &str,
    store: Arc<dyn MetadataStore>,
    runner: Arc<dyn SandboxRunner>,
) {
    let finished = loop {
        match runner.is_running(handle).await {
            Ok(true) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(false) => break true,
            Err(e) => {
                tracing::warn!(request_id, handle, error = %e, "Sandbox poll failed");
                break false;
            }
        }
    };

    if finished {
        match store.get(request_id).await {
            Ok(Some(mut record)) => {
                record.status = JobStatus::Done;
                if let Err(e) = store.put(&record).await {
                    tracing::warn!(request_id, error = %e, "Failed to persist done status");
                } else {
                    tracing::info!(request_id, "Processing complete, job marked done");
                }
            }
            Ok(None) => {
                tracing::warn!(request_id, "Job record vanished before completion");
            }
            Err(e) => {
                tracing::warn!(request_id, error = %e, "Failed to re-read job record");
            }
        }
    }

    if let Err(e) = runner.remove(handle).await {
        tracing::warn!(request_id, handle, error = %e, "Sandbox removal failed");
    }
}
