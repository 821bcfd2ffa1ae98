use serde::{Deserialize, Serialize};

use super::ml::RecalculationSummary;

/// Lifecycle state of a tracked job.
///
/// `Pending` and `Running` are the only non-terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result payload of a successful job, tagged by job kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    ModelRecalculation(RecalculationSummary),
}

/// Point-in-time view of a job. This is also the wire format returned by
/// the job-status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
    /// 0-100
    pub progress: u8,
    /// Milliseconds since epoch
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub result: Option<JobOutcome>,
}

impl Job {
    pub fn new(job_id: String, description: String, now_ms: i64) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            message: description,
            progress: 0,
            start_time: now_ms,
            end_time: None,
            result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_job_serializes_wire_fields() {
        let job = Job::new("abc".to_string(), "ML Model Recalculation".to_string(), 1_700_000_000_000);
        let json = serde_json::to_value(&job).unwrap();

        assert_eq!(json["jobId"], "abc");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["progress"], 0);
        assert_eq!(json["startTime"], 1_700_000_000_000i64);
        assert!(json["endTime"].is_null());
        assert!(json["result"].is_null());
    }
}
