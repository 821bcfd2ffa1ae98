use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::errors::AppError;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 * * * *";

/// Runtime configuration read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub db_max_connections: u32,
    pub max_concurrent_jobs: usize,
    pub job_retention: Duration,
    pub job_cleanup_schedule: String,
    pub database_instances: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup so tests don't touch
    /// process-wide environment variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| AppError::Config("DATABASE_URL must be set".to_string()))?;

        let bind_addr = parse_or(&lookup, "BIND_ADDR", DEFAULT_BIND_ADDR.parse::<SocketAddr>())?;
        let db_max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", Ok(10u32))?;
        let max_concurrent_jobs = parse_or(&lookup, "MAX_CONCURRENT_JOBS", Ok(2usize))?;
        let retention_hours = parse_or(&lookup, "JOB_RETENTION_HOURS", Ok(24u64))?;

        if max_concurrent_jobs == 0 {
            return Err(AppError::Config(
                "MAX_CONCURRENT_JOBS must be at least 1".to_string(),
            ));
        }
        if max_concurrent_jobs > Semaphore::MAX_PERMITS {
            return Err(AppError::Config(format!(
                "MAX_CONCURRENT_JOBS must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        // Cutoffs are computed in i64 milliseconds
        let job_retention = retention_hours
            .checked_mul(60 * 60)
            .filter(|secs| secs.checked_mul(1000).is_some_and(|ms| ms <= i64::MAX as u64))
            .map(Duration::from_secs)
            .ok_or_else(|| {
                AppError::Config(format!("JOB_RETENTION_HOURS={} is too large", retention_hours))
            })?;

        let job_cleanup_schedule = lookup("JOB_CLEANUP_SCHEDULE")
            .unwrap_or_else(|| DEFAULT_CLEANUP_SCHEDULE.to_string());

        let database_instances: Vec<String> = lookup("DATABASE_INSTANCES")
            .unwrap_or_else(|| "default".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if database_instances.is_empty() {
            return Err(AppError::Config(
                "DATABASE_INSTANCES must name at least one instance".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            bind_addr,
            db_max_connections,
            max_concurrent_jobs,
            job_retention,
            job_cleanup_schedule,
            database_instances,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: Result<T, T::Err>) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AppError::Config(format!("Invalid {}='{}': {}", key, raw, e))),
        None => default.map_err(|e| AppError::Config(format!("Invalid default for {}: {}", key, e))),
    }
}
