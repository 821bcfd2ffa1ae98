use std::sync::Arc;

use sqlx::PgPool;

use crate::services::job_tracking_service::JobTracker;
use crate::services::recalculation_service::RecalculationService;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub job_tracker: Arc<JobTracker>,
    pub recalculation: Arc<RecalculationService>,
    /// Instance names accepted in `/api/:instance/...` paths
    pub database_instances: Arc<Vec<String>>,
}

impl AppState {
    pub fn is_instance_available(&self, instance: &str) -> bool {
        self.database_instances.iter().any(|name| name == instance)
    }
}
