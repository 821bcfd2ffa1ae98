use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::errors::AppError;
use crate::services::job_tracking_service::JobTracker;

/// Cron scheduler for housekeeping that runs alongside the HTTP server.
pub struct JobSchedulerService {
    scheduler: JobScheduler,
    job_tracker: Arc<JobTracker>,
}

impl JobSchedulerService {
    pub async fn new(job_tracker: Arc<JobTracker>) -> Result<Self, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::External(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            job_tracker,
        })
    }

    /// Register the finished-job retention sweep and start the scheduler.
    ///
    /// `cleanup_schedule` uses the six-field format: sec min hour day month weekday.
    pub async fn start(&mut self, cleanup_schedule: &str) -> Result<(), AppError> {
        info!("🚀 Starting job scheduler...");

        let tracker = Arc::clone(&self.job_tracker);
        let cleanup = Job::new(cleanup_schedule, move |_uuid, _l| {
            let removed = tracker.cleanup_old_jobs();
            info!("🧹 Retention sweep finished ({} jobs removed)", removed);
        })
        .map_err(|e| AppError::Config(format!("Invalid cleanup schedule '{}': {}", cleanup_schedule, e)))?;

        self.scheduler
            .add(cleanup)
            .await
            .map_err(|e| AppError::External(format!("Failed to add cleanup job: {}", e)))?;
        info!("📅 Scheduled: cleanup_old_jobs [cron: {}]", cleanup_schedule);

        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::External(format!("Failed to start scheduler: {}", e)))?;

        info!("✅ Job scheduler started");
        Ok(())
    }

    /// Stop the scheduler gracefully
    pub async fn stop(&mut self) -> Result<(), AppError> {
        info!("🛑 Stopping job scheduler...");
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::External(format!("Failed to stop scheduler: {}", e)))?;
        info!("✅ Job scheduler stopped");
        Ok(())
    }
}
