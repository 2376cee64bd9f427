//! Tracked task spawning with cancellation
//!
//! A [`TaskGroup`] owns every task spawned through it. Tasks race their
//! future against the group's cancellation token, and
//! [`TaskGroup::shutdown`] cancels, waits out a grace period, then aborts
//! whatever is still running.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct Tracked {
    name: String,
    handle: JoinHandle<()>,
    started_at: Instant,
}

impl Tracked {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Outcome of [`TaskGroup::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished within the grace period
    pub completed: usize,
    /// Tasks that had to be aborted
    pub aborted: usize,
}

/// Set of tasks sharing one cancellation token
#[derive(Debug)]
pub struct TaskGroup {
    name: String,
    next_task_id: AtomicUsize,
    tasks: Mutex<Vec<Tracked>>,
    cancel_token: CancellationToken,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    /// Create a group driven by an existing token
    pub fn with_token(name: impl Into<String>, cancel_token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            next_task_id: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            cancel_token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Spawn a task that stops at the first of completion or cancellation
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> usize
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.into();
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.cancel_token.clone();
        let group = self.name.clone();
        let label = task_name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    debug!(group = %group, task = %label, id = task_id, "task cancelled");
                }
                _ = future => {
                    debug!(group = %group, task = %label, id = task_id, "task completed");
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(Tracked {
            name: task_name,
            handle,
            started_at: Instant::now(),
        });
        task_id
    }

    /// Number of tasks still running
    pub fn active_task_count(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Signal cancellation without waiting
    pub fn cancel_all(&self) {
        self.cancel_token.cancel();
    }

    /// Cancel all tasks, wait up to `grace` for them, then abort the rest
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.cancel_all();
        let handles: Vec<Tracked> = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();

        for mut task in handles {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(e)) => {
                    warn!(group = %self.name, task = %task.name, error = %e, "task ended abnormally");
                    report.completed += 1;
                }
                Err(_) => {
                    warn!(
                        group = %self.name,
                        task = %task.name,
                        runtime = ?task.started_at.elapsed(),
                        "task did not stop within grace period, aborting"
                    );
                    task.handle.abort();
                    report.aborted += 1;
                }
            }
        }

        debug!(group = %self.name, completed = report.completed, aborted = report.aborted, "task group shut down");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_cancellation_stops_cooperative_tasks() {
        let group = TaskGroup::new("test");
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        group.spawn("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(group.active_task_count(), 1);

        let report = group.shutdown(Duration::from_millis(500)).await;
        assert_eq!(report, ShutdownReport { completed: 1, aborted: 0 });
        assert!(!finished.load(Ordering::SeqCst));
        assert!(group.is_cancelled());
        assert_eq!(group.active_task_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stragglers_are_aborted() {
        let group = TaskGroup::new("test");
        group.spawn("blocking", async {
            std::thread::sleep(Duration::from_millis(500));
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = group.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report, ShutdownReport { completed: 0, aborted: 1 });
    }

    #[tokio::test]
    async fn test_finished_tasks_are_pruned_on_spawn() {
        let group = TaskGroup::new("test");
        group.spawn("quick", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        group.spawn("second", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(group.tasks.lock().len(), 1);
        group.cancel_all();
    }

    #[tokio::test]
    async fn test_shared_token() {
        let token = CancellationToken::new();
        let group = TaskGroup::with_token("shared", token.clone());
        token.cancel();
        assert!(group.is_cancelled());
        let report = group.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report, ShutdownReport::default());
    }
}
