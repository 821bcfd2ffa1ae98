pub mod job_scheduler_service;
pub mod job_tracking_service;
pub mod recalculation_service;
pub mod scoring_store;
