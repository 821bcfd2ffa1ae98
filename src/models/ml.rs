use serde::{Deserialize, Serialize};

/// Version of the `RecalculationSummary` layout stored as a job result.
pub const RECALCULATION_SUMMARY_VERSION: u32 = 1;

/// Summary handed to the job tracker when a recalculation run succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationSummary {
    pub schema_version: u32,
    pub message: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
    /// Rows written into the training aggregate table
    pub training_rows: u64,
    /// Drivers that received a fresh safe-driver score
    pub updated_drivers: u64,
    pub executed_statements: u32,
    pub execution_time_ms: u64,
}

/// Output of the accident model training call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub num_iterations: i32,
    pub num_rows_processed: i64,
    pub log_likelihood: Option<f64>,
}

/// Accident probability predicted for a single driver.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DriverPrediction {
    pub driver_id: i32,
    pub accident_probability: f64,
}

/// Safe-driver score derived from a prediction, ready to be persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafeDriverScore {
    pub driver_id: i32,
    /// 0-100, higher is safer
    pub score: f64,
    pub risk_category: RiskCategory,
}

impl SafeDriverScore {
    pub fn from_prediction(prediction: &DriverPrediction) -> Self {
        let probability = prediction.accident_probability.clamp(0.0, 1.0);
        let score = ((1.0 - probability) * 10_000.0).round() / 100.0;
        Self {
            driver_id: prediction.driver_id,
            score,
            risk_category: RiskCategory::from_score(score),
        }
    }
}

/// Risk bucket assigned from a safe-driver score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCategory {
    Excellent,
    Good,
    Average,
    Poor,
    HighRisk,
}

impl RiskCategory {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            RiskCategory::Excellent
        } else if score >= 80.0 {
            RiskCategory::Good
        } else if score >= 70.0 {
            RiskCategory::Average
        } else if score >= 60.0 {
            RiskCategory::Poor
        } else {
            RiskCategory::HighRisk
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskCategory::Excellent => "EXCELLENT",
            RiskCategory::Good => "GOOD",
            RiskCategory::Average => "AVERAGE",
            RiskCategory::Poor => "POOR",
            RiskCategory::HighRisk => "HIGH_RISK",
        }
    }
}

/// Description of the currently deployed accident model.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_id: String,
    pub algorithm: String,
    pub num_iterations: Option<i32>,
    pub num_rows_processed: Option<i64>,
    pub log_likelihood: Option<f64>,
    pub coefficients: Vec<f64>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_category_thresholds() {
        assert_eq!(RiskCategory::from_score(95.0), RiskCategory::Excellent);
        assert_eq!(RiskCategory::from_score(90.0), RiskCategory::Excellent);
        assert_eq!(RiskCategory::from_score(89.99), RiskCategory::Good);
        assert_eq!(RiskCategory::from_score(70.0), RiskCategory::Average);
        assert_eq!(RiskCategory::from_score(60.0), RiskCategory::Poor);
        assert_eq!(RiskCategory::from_score(59.9), RiskCategory::HighRisk);
    }

    #[test]
    fn test_score_from_prediction() {
        let score = SafeDriverScore::from_prediction(&DriverPrediction {
            driver_id: 7,
            accident_probability: 0.125,
        });
        assert_eq!(score.driver_id, 7);
        assert_eq!(score.score, 87.5);
        assert_eq!(score.risk_category, RiskCategory::Good);
    }

    #[test]
    fn test_out_of_range_probability_is_clamped() {
        let score = SafeDriverScore::from_prediction(&DriverPrediction {
            driver_id: 1,
            accident_probability: 1.7,
        });
        assert_eq!(score.score, 0.0);
        assert_eq!(score.risk_category, RiskCategory::HighRisk);
    }
}
