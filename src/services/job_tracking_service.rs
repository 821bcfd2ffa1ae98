use std::any::Any;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{Job, JobOutcome, JobStatus};

/// How long finished jobs stay visible before the retention sweep drops them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// In-memory registry of jobs and the tasks running them.
///
/// Owns the job state machine: every status change goes through this type.
/// Terminal transitions are decided while holding the job's map entry, so
/// when a cancel races a completion exactly one of them is applied and the
/// other becomes a no-op. Unknown job ids are never an error here; lookups
/// return `None`/`false` and mutations are silently skipped.
///
/// Nothing is persisted; all jobs are lost when the process exits.
pub struct JobTracker {
    jobs: DashMap<String, Job>,
    handles: DashMap<String, AbortHandle>,
    retention: Duration,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            handles: DashMap::new(),
            retention,
        }
    }

    /// Register a new `PENDING` job and return its id.
    pub fn create_job(&self, description: &str) -> String {
        let job_id = Uuid::new_v4().to_string();
        let job = Job::new(job_id.clone(), description.to_string(), now_ms());
        self.jobs.insert(job_id.clone(), job);

        debug!(job_id = %job_id, "📝 Created job: {}", description);
        job_id
    }

    pub fn start_job(&self, job_id: &str) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            if job.status.is_terminal() {
                debug!(job_id, status = %job.status, "Ignoring start for finished job");
                return;
            }
            job.status = JobStatus::Running;
            job.start_time = now_ms();
        }
    }

    /// Record a progress checkpoint. An empty `message` keeps the current one.
    ///
    /// Ordering is the caller's responsibility; updates to finished jobs are dropped.
    pub fn update_progress(&self, job_id: &str, percent: u8, message: &str) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            if job.status.is_terminal() {
                return;
            }
            job.progress = percent.min(100);
            if !message.is_empty() {
                job.message = message.to_string();
            }
        }
    }

    /// Mark the job `COMPLETED`. Returns false if it had already finished.
    pub fn complete_job(&self, job_id: &str, result: JobOutcome) -> bool {
        let applied = self.finish(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.result = Some(result);
        });
        self.handles.remove(job_id);

        if applied {
            info!(job_id, "✅ Job completed");
        }
        applied
    }

    /// Mark the job `FAILED` with `error_message`. Returns false if it had already finished.
    pub fn fail_job(&self, job_id: &str, error_message: &str) -> bool {
        let applied = self.finish(job_id, |job| {
            job.status = JobStatus::Failed;
            job.message = error_message.to_string();
        });
        self.handles.remove(job_id);

        if applied {
            warn!(job_id, "❌ Job failed: {}", error_message);
        }
        applied
    }

    pub fn get_status(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).map(|job| job.value().clone())
    }

    /// Snapshots of every job that has not reached a terminal state.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Attach the task running `job_id` so it can be cancelled.
    ///
    /// A watcher awaits the task: a panic, an `Err` the task returns, or an
    /// abort that was not recorded as a cancellation all end in `fail_job`,
    /// so no job stays `RUNNING` after its task is gone. The handle is
    /// released once the task finishes.
    pub fn register_future<T, E>(self: &Arc<Self>, job_id: &str, task: JoinHandle<Result<T, E>>)
    where
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.handles.insert(job_id.to_string(), task.abort_handle());

        let tracker = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(job_id = %job_id, "Job task returned an unhandled error: {}", e);
                    tracker.fail_job(&job_id, &e.to_string());
                }
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    error!(job_id = %job_id, "Job task panicked: {}", message);
                    tracker.fail_job(&job_id, &message);
                }
                Err(_) => {
                    // Aborted. A cancel already made the job terminal, so this only
                    // catches aborts from elsewhere (e.g. runtime shutdown).
                    tracker.fail_job(&job_id, "Job interrupted before completion");
                }
            }
            tracker.handles.remove(&job_id);
        });
    }

    /// Request best-effort cancellation of a running job.
    ///
    /// Returns true only if a live task was registered for the job and the
    /// job was still non-terminal; the job is then `CANCELLED` and the task
    /// is aborted at its next await point.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let Some(handle) = self.handles.get(job_id).map(|h| h.value().clone()) else {
            return false;
        };

        if handle.is_finished() {
            self.handles.remove(job_id);
            return false;
        }

        let cancelled = self.finish(job_id, |job| {
            job.status = JobStatus::Cancelled;
        });
        self.handles.remove(job_id);

        if cancelled {
            handle.abort();
            info!(job_id, "🛑 Job cancelled");
        }
        cancelled
    }

    /// Drop finished jobs whose `end_time` is older than the retention window.
    /// Jobs that have not finished are kept regardless of age.
    pub fn cleanup_old_jobs(&self) -> usize {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(retention_ms);
        let mut removed = 0;

        self.jobs.retain(|_, job| {
            let keep = job.end_time.map_or(true, |end| end >= cutoff);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            info!("🧹 Removed {} finished jobs past retention", removed);
        }
        removed
    }

    fn finish<F>(&self, job_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        match self.jobs.get_mut(job_id) {
            Some(mut job) if !job.status.is_terminal() => {
                apply(job.value_mut());
                job.end_time = Some(now_ms());
                true
            }
            Some(job) => {
                debug!(job_id, status = %job.status, "Job already finished, ignoring transition");
                false
            }
            None => false,
        }
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Job task panicked".to_string()
    }
}
