mod api_response;
pub mod job;
pub mod ml;

pub use api_response::ApiResponse;
pub use job::{Job, JobOutcome, JobStatus};
pub use ml::{
    DriverPrediction, ModelInfo, RecalculationSummary, RiskCategory, SafeDriverScore,
    TrainedModel, RECALCULATION_SUMMARY_VERSION,
};
