use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::ml_queries;
use crate::errors::AppError;
use crate::models::{DriverPrediction, ModelInfo, SafeDriverScore, TrainedModel};

/// Data-access operations the recalculation pipeline sequences.
///
/// The pipeline only orders and guards these calls; what each one does to
/// the database is up to the implementation.
#[async_trait]
pub trait ScoringStore: Send + Sync {
    /// Rebuild per-driver training aggregates. Returns rows written.
    async fn refresh_training_data(&self) -> Result<u64, AppError>;

    async fn drop_accident_model(&self) -> Result<(), AppError>;

    async fn train_accident_model(&self) -> Result<TrainedModel, AppError>;

    async fn predict_accident_probabilities(&self) -> Result<Vec<DriverPrediction>, AppError>;

    /// Persist scores. Returns rows written.
    async fn persist_scores(&self, scores: &[SafeDriverScore]) -> Result<u64, AppError>;

    async fn latest_model_info(&self) -> Result<Option<ModelInfo>, AppError>;
}

/// Postgres + MADlib backed store.
#[derive(Clone)]
pub struct PgScoringStore {
    pool: PgPool,
}

impl PgScoringStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScoringStore for PgScoringStore {
    async fn refresh_training_data(&self) -> Result<u64, AppError> {
        ml_queries::refresh_training_data(&self.pool).await
    }

    async fn drop_accident_model(&self) -> Result<(), AppError> {
        ml_queries::drop_accident_model(&self.pool).await
    }

    async fn train_accident_model(&self) -> Result<TrainedModel, AppError> {
        ml_queries::train_accident_model(&self.pool).await
    }

    async fn predict_accident_probabilities(&self) -> Result<Vec<DriverPrediction>, AppError> {
        ml_queries::predict_accident_probabilities(&self.pool).await
    }

    async fn persist_scores(&self, scores: &[SafeDriverScore]) -> Result<u64, AppError> {
        ml_queries::insert_safe_driver_scores(&self.pool, scores).await
    }

    async fn latest_model_info(&self) -> Result<Option<ModelInfo>, AppError> {
        ml_queries::fetch_model_info(&self.pool).await
    }
}
