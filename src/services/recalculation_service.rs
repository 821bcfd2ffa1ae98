//! Staged accident-model recalculation.
//!
//! A recalculation runs as one tokio task per job. The task waits for a
//! worker permit (the job stays `PENDING` meanwhile), marks the job
//! `RUNNING`, then runs each stage of the pipeline in order, reporting a
//! fixed progress checkpoint around every stage.
//!
//! The first stage error stops the run and fails the job with that error's
//! text. Nothing done by earlier stages is rolled back: a failure while
//! training leaves the previous model dropped and the training aggregates
//! rewritten.
//!
//! Cancellation aborts the task at its next await point. A database
//! statement that is already executing keeps running server-side until it
//! finishes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::models::{
    DriverPrediction, JobOutcome, ModelInfo, RecalculationSummary, SafeDriverScore, TrainedModel,
    RECALCULATION_SUMMARY_VERSION,
};
use crate::services::job_tracking_service::JobTracker;
use crate::services::scoring_store::ScoringStore;

pub const RECALCULATION_JOB_DESCRIPTION: &str = "ML Model Recalculation";

/// State carried from one stage to the next within a single run.
#[derive(Debug, Default)]
pub struct StageContext {
    pub training_rows: u64,
    pub model: Option<TrainedModel>,
    pub predictions: Vec<DriverPrediction>,
    pub updated_drivers: u64,
    pub executed_statements: u32,
}

/// One step of a pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Progress percentage reported once this stage has finished.
    fn checkpoint(&self) -> u8;

    /// Short text shown as the job message while the stage runs.
    fn description(&self) -> &'static str;

    async fn run(&self, ctx: &mut StageContext) -> Result<(), AppError>;
}

/// Fixed, ordered list of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self { stages }
    }

    /// Refresh aggregates, drop the old model, train, predict, persist scores.
    pub fn model_recalculation(store: Arc<dyn ScoringStore>) -> Self {
        Self::new(vec![
            Box::new(RefreshTrainingData(Arc::clone(&store))),
            Box::new(DropPreviousModel(Arc::clone(&store))),
            Box::new(TrainAccidentModel(Arc::clone(&store))),
            Box::new(GeneratePredictions(Arc::clone(&store))),
            Box::new(PersistScores(store)),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order against `job_id`, stopping at the first error.
    pub async fn execute(&self, tracker: &JobTracker, job_id: &str) -> Result<StageContext, AppError> {
        let mut ctx = StageContext::default();
        let mut reached = 0u8;
        let total = self.stages.len();

        for (index, stage) in self.stages.iter().enumerate() {
            info!(job_id, stage = stage.name(), "🏃 Stage {}/{}: {}", index + 1, total, stage.description());
            tracker.update_progress(job_id, reached, stage.description());

            let started = Instant::now();
            if let Err(e) = stage.run(&mut ctx).await {
                warn!(
                    job_id,
                    stage = stage.name(),
                    "❌ Stage failed after {}ms: {}",
                    started.elapsed().as_millis(),
                    e
                );
                return Err(e);
            }

            reached = stage.checkpoint();
            tracker.update_progress(job_id, reached, "");
            info!(
                job_id,
                stage = stage.name(),
                "✅ Stage finished in {}ms ({}%)",
                started.elapsed().as_millis(),
                reached
            );
        }

        Ok(ctx)
    }
}

/// Drive one job through `pipeline` and record the outcome on the tracker.
///
/// Stage errors are turned into a failed job here and never propagate.
pub async fn run_pipeline(tracker: &JobTracker, pipeline: &Pipeline, job_id: &str) {
    let started = Instant::now();
    tracker.start_job(job_id);

    match pipeline.execute(tracker, job_id).await {
        Ok(ctx) => {
            tracker.update_progress(job_id, 100, "Model recalculation completed");
            let summary = RecalculationSummary {
                schema_version: RECALCULATION_SUMMARY_VERSION,
                message: "ML model successfully recalculated".to_string(),
                timestamp: Utc::now().timestamp_millis(),
                training_rows: ctx.training_rows,
                updated_drivers: ctx.updated_drivers,
                executed_statements: ctx.executed_statements,
                execution_time_ms: started.elapsed().as_millis() as u64,
            };
            tracker.complete_job(job_id, JobOutcome::ModelRecalculation(summary));
        }
        Err(e) => {
            tracker.fail_job(job_id, &e.to_string());
        }
    }
}

/// Launches recalculation jobs on a bounded pool of workers.
pub struct RecalculationService {
    tracker: Arc<JobTracker>,
    store: Arc<dyn ScoringStore>,
    workers: Arc<Semaphore>,
}

impl RecalculationService {
    pub fn new(tracker: Arc<JobTracker>, store: Arc<dyn ScoringStore>, max_concurrent_jobs: usize) -> Self {
        Self {
            tracker,
            store,
            workers: Arc::new(Semaphore::new(max_concurrent_jobs.min(Semaphore::MAX_PERMITS))),
        }
    }

    /// Create a recalculation job, start it in the background and return its id.
    pub fn start_recalculation(&self) -> String {
        let pipeline = Pipeline::model_recalculation(Arc::clone(&self.store));
        self.launch(RECALCULATION_JOB_DESCRIPTION, pipeline)
    }

    /// Create a job for `pipeline` and spawn it. Returns without waiting for any stage.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, description: &str, pipeline: Pipeline) -> String {
        let job_id = self.tracker.create_job(description);

        let tracker = Arc::clone(&self.tracker);
        let workers = Arc::clone(&self.workers);
        let id = job_id.clone();
        let task = tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|e| AppError::External(format!("Worker pool closed: {}", e)))?;
            run_pipeline(&tracker, &pipeline, &id).await;
            Ok::<(), AppError>(())
        });

        self.tracker.register_future(&job_id, task);
        info!(job_id = %job_id, "🚀 Launched job: {}", description);
        job_id
    }

    pub async fn model_info(&self) -> Result<Option<ModelInfo>, AppError> {
        self.store.latest_model_info().await
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

struct RefreshTrainingData(Arc<dyn ScoringStore>);

#[async_trait]
impl PipelineStage for RefreshTrainingData {
    fn name(&self) -> &'static str {
        "refresh_training_data"
    }

    fn checkpoint(&self) -> u8 {
        20
    }

    fn description(&self) -> &'static str {
        "Refreshing driver training data"
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<(), AppError> {
        ctx.training_rows = self
            .0
            .refresh_training_data()
            .await
            .map_err(|e| AppError::stage(self.name(), e))?;
        ctx.executed_statements += 2;
        Ok(())
    }
}

struct DropPreviousModel(Arc<dyn ScoringStore>);

#[async_trait]
impl PipelineStage for DropPreviousModel {
    fn name(&self) -> &'static str {
        "drop_previous_model"
    }

    fn checkpoint(&self) -> u8 {
        30
    }

    fn description(&self) -> &'static str {
        "Dropping previous accident model"
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<(), AppError> {
        self.0
            .drop_accident_model()
            .await
            .map_err(|e| AppError::stage(self.name(), e))?;
        ctx.executed_statements += 1;
        Ok(())
    }
}

struct TrainAccidentModel(Arc<dyn ScoringStore>);

#[async_trait]
impl PipelineStage for TrainAccidentModel {
    fn name(&self) -> &'static str {
        "train_model"
    }

    fn checkpoint(&self) -> u8 {
        60
    }

    fn description(&self) -> &'static str {
        "Training accident model"
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<(), AppError> {
        let model = self
            .0
            .train_accident_model()
            .await
            .map_err(|e| AppError::stage(self.name(), e))?;
        info!(
            "🧠 Model trained: {} iterations over {} rows",
            model.num_iterations, model.num_rows_processed
        );
        ctx.model = Some(model);
        ctx.executed_statements += 2;
        Ok(())
    }
}

struct GeneratePredictions(Arc<dyn ScoringStore>);

#[async_trait]
impl PipelineStage for GeneratePredictions {
    fn name(&self) -> &'static str {
        "generate_predictions"
    }

    fn checkpoint(&self) -> u8 {
        80
    }

    fn description(&self) -> &'static str {
        "Generating driver predictions"
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<(), AppError> {
        ctx.predictions = self
            .0
            .predict_accident_probabilities()
            .await
            .map_err(|e| AppError::stage(self.name(), e))?;
        ctx.executed_statements += 1;
        Ok(())
    }
}

struct PersistScores(Arc<dyn ScoringStore>);

#[async_trait]
impl PipelineStage for PersistScores {
    fn name(&self) -> &'static str {
        "persist_scores"
    }

    fn checkpoint(&self) -> u8 {
        100
    }

    fn description(&self) -> &'static str {
        "Saving safe driver scores"
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<(), AppError> {
        let scores: Vec<SafeDriverScore> = ctx
            .predictions
            .iter()
            .map(SafeDriverScore::from_prediction)
            .collect();

        ctx.updated_drivers = self
            .0
            .persist_scores(&scores)
            .await
            .map_err(|e| AppError::stage(self.name(), e))?;
        ctx.executed_statements += scores.len() as u32;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobStatus};
    use crate::services::scoring_store::test_support::InMemoryScoringStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn wait_for<F>(tracker: &JobTracker, job_id: &str, done: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        for _ in 0..200 {
            if let Some(job) = tracker.get_status(job_id) {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not reach the expected state", job_id);
    }

    fn service(store: InMemoryScoringStore, workers: usize) -> (Arc<JobTracker>, Arc<InMemoryScoringStore>, RecalculationService) {
        let tracker = Arc::new(JobTracker::new());
        let store = Arc::new(store);
        let service = RecalculationService::new(Arc::clone(&tracker), store.clone(), workers);
        (tracker, store, service)
    }

    /// Counts invocations and optionally fails.
    struct CountingStage {
        name: &'static str,
        checkpoint: u8,
        fail: bool,
        invocations: Arc<AtomicUsize>,
        seen_progress: Arc<Mutex<Vec<u8>>>,
        tracker: Arc<JobTracker>,
        job_id: Arc<Mutex<String>>,
    }

    #[async_trait]
    impl PipelineStage for CountingStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn checkpoint(&self) -> u8 {
            self.checkpoint
        }

        fn description(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &mut StageContext) -> Result<(), AppError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let job_id = self.job_id.lock().unwrap().clone();
            if let Some(job) = self.tracker.get_status(&job_id) {
                self.seen_progress.lock().unwrap().push(job.progress);
            }
            if self.fail {
                return Err(AppError::External(format!("{} exploded", self.name)));
            }
            Ok(())
        }
    }

    fn counting_pipeline(
        tracker: &Arc<JobTracker>,
        fail_at: Option<usize>,
    ) -> (Pipeline, Arc<AtomicUsize>, Arc<Mutex<Vec<u8>>>, Arc<Mutex<String>>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let job_id = Arc::new(Mutex::new(String::new()));
        let stages: Vec<Box<dyn PipelineStage>> = [("first", 25u8), ("second", 50), ("third", 75), ("fourth", 100)]
            .into_iter()
            .enumerate()
            .map(|(i, (name, checkpoint))| {
                Box::new(CountingStage {
                    name,
                    checkpoint,
                    fail: fail_at == Some(i),
                    invocations: Arc::clone(&invocations),
                    seen_progress: Arc::clone(&seen),
                    tracker: Arc::clone(tracker),
                    job_id: Arc::clone(&job_id),
                }) as Box<dyn PipelineStage>
            })
            .collect();
        (Pipeline::new(stages), invocations, seen, job_id)
    }

    #[test]
    fn test_canonical_stage_order() {
        let store: Arc<dyn ScoringStore> = Arc::new(InMemoryScoringStore::default());
        let pipeline = Pipeline::model_recalculation(store);
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "refresh_training_data",
                "drop_previous_model",
                "train_model",
                "generate_predictions",
                "persist_scores"
            ]
        );
    }

    #[tokio::test]
    async fn test_recalculation_completes_with_summary() {
        let (tracker, store, service) = service(InMemoryScoringStore::with_drivers(4), 2);

        let job_id = service.start_recalculation();
        let job = wait_for(&tracker, &job_id, |j| j.status.is_terminal()).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.message, "Model recalculation completed");
        assert!(job.end_time.is_some());

        let Some(JobOutcome::ModelRecalculation(summary)) = job.result else {
            panic!("missing recalculation summary");
        };
        assert_eq!(summary.schema_version, RECALCULATION_SUMMARY_VERSION);
        assert_eq!(summary.training_rows, 4);
        assert_eq!(summary.updated_drivers, 4);
        assert_eq!(summary.executed_statements, 2 + 1 + 2 + 1 + 4);

        assert_eq!(
            store.calls(),
            vec![
                "refresh_training_data",
                "drop_accident_model",
                "train_accident_model",
                "predict_accident_probabilities",
                "persist_scores"
            ]
        );
        let persisted = store.persisted.lock().unwrap();
        assert_eq!(persisted.len(), 4);
        assert_eq!(persisted[0].score, 95.0);
    }

    #[tokio::test]
    async fn test_failing_stage_stops_pipeline() {
        let tracker = Arc::new(JobTracker::new());
        let (pipeline, invocations, _, job_id_slot) = counting_pipeline(&tracker, Some(1));

        let job_id = tracker.create_job("demo");
        *job_id_slot.lock().unwrap() = job_id.clone();
        run_pipeline(&tracker, &pipeline, &job_id).await;

        let job = tracker.get_status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "External error: second exploded");
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(job.result.is_none());
        assert!(job.end_time.is_some());
    }

    #[tokio::test]
    async fn test_progress_reported_at_checkpoints() {
        let tracker = Arc::new(JobTracker::new());
        let (pipeline, invocations, seen, job_id_slot) = counting_pipeline(&tracker, None);

        let job_id = tracker.create_job("demo");
        *job_id_slot.lock().unwrap() = job_id.clone();
        run_pipeline(&tracker, &pipeline, &job_id).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 4);
        // Each stage starts at the checkpoint its predecessor reached
        assert_eq!(*seen.lock().unwrap(), vec![0, 25, 50, 75]);
        assert_eq!(tracker.get_status(&job_id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_store_error_fails_job_with_stage_message() {
        let store = InMemoryScoringStore {
            fail_on: Some("train_accident_model"),
            ..InMemoryScoringStore::with_drivers(3)
        };
        let (tracker, store, service) = service(store, 1);

        let job_id = service.start_recalculation();
        let job = wait_for(&tracker, &job_id, |j| j.status.is_terminal()).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.message,
            "train_model failed: External error: train_accident_model unavailable"
        );
        assert_eq!(job.progress, 30);
        // Earlier stages stay applied and later ones never run
        assert_eq!(
            store.calls(),
            vec!["refresh_training_data", "drop_accident_model", "train_accident_model"]
        );
    }

    #[tokio::test]
    async fn test_launch_returns_before_any_stage_runs() {
        let gate = Arc::new(Notify::new());
        let store = InMemoryScoringStore {
            training_gate: Some(Arc::clone(&gate)),
            ..InMemoryScoringStore::with_drivers(2)
        };
        let (tracker, store, service) = service(store, 1);

        let job_id = service.start_recalculation();
        let job = tracker.get_status(&job_id).unwrap();
        assert!(!job.status.is_terminal());

        let job = wait_for(&tracker, &job_id, |j| j.message == "Training accident model").await;
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 30);

        gate.notify_one();
        let job = wait_for(&tracker, &job_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(store.persisted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_running_recalculation() {
        let gate = Arc::new(Notify::new());
        let store = InMemoryScoringStore {
            training_gate: Some(Arc::clone(&gate)),
            ..InMemoryScoringStore::with_drivers(2)
        };
        let (tracker, store, service) = service(store, 1);

        let job_id = service.start_recalculation();
        wait_for(&tracker, &job_id, |j| j.message == "Training accident model").await;

        assert!(tracker.cancel_job(&job_id));
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job = tracker.get_status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
        assert!(!store.calls().contains(&"persist_scores"));
        assert!(!tracker.cancel_job(&job_id));
        assert_eq!(service.available_workers(), 1);
    }

    #[tokio::test]
    async fn test_jobs_beyond_pool_size_wait_pending() {
        let gate = Arc::new(Notify::new());
        let store = InMemoryScoringStore {
            training_gate: Some(Arc::clone(&gate)),
            ..InMemoryScoringStore::with_drivers(1)
        };
        let (tracker, _store, service) = service(store, 1);

        let first = service.start_recalculation();
        wait_for(&tracker, &first, |j| j.status == JobStatus::Running).await;

        let second = service.start_recalculation();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tracker.get_status(&second).unwrap().status, JobStatus::Pending);

        // Queued jobs can be cancelled before they ever run
        assert!(tracker.cancel_job(&second));
        assert_eq!(tracker.get_status(&second).unwrap().status, JobStatus::Cancelled);

        gate.notify_one();
        let job = wait_for(&tracker, &first, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_oversized_pool_is_capped() {
        let (_tracker, _store, service) = service(InMemoryScoringStore::default(), usize::MAX);
        assert_eq!(service.available_workers(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn test_model_info_delegates_to_store() {
        let (tracker, _store, service) = service(InMemoryScoringStore::with_drivers(1), 1);
        assert!(service.model_info().await.unwrap().is_none());

        let job_id = service.start_recalculation();
        wait_for(&tracker, &job_id, |j| j.status.is_terminal()).await;

        let info = service.model_info().await.unwrap().unwrap();
        assert_eq!(info.algorithm, "Logistic Regression");
    }
}
