use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use fleet_risk_backend::app;
use fleet_risk_backend::config::AppConfig;
use fleet_risk_backend::logging::{init_logging, LoggingConfig};
use fleet_risk_backend::services::job_scheduler_service::JobSchedulerService;
use fleet_risk_backend::services::job_tracking_service::JobTracker;
use fleet_risk_backend::services::recalculation_service::RecalculationService;
use fleet_risk_backend::services::scoring_store::PgScoringStore;
use fleet_risk_backend::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging FIRST
    init_logging(LoggingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let job_tracker = Arc::new(JobTracker::with_retention(config.job_retention));
    let store = Arc::new(PgScoringStore::new(pool.clone()));
    let recalculation = Arc::new(RecalculationService::new(
        Arc::clone(&job_tracker),
        store,
        config.max_concurrent_jobs,
    ));

    let mut scheduler = JobSchedulerService::new(Arc::clone(&job_tracker)).await?;
    scheduler.start(&config.job_cleanup_schedule).await?;

    let state = AppState {
        pool,
        job_tracker,
        recalculation,
        database_instances: Arc::new(config.database_instances.clone()),
    };
    let app = app::create_app(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(
        "🚀 Fleet risk backend running at http://{}/ (max {} concurrent jobs)",
        config.bind_addr,
        config.max_concurrent_jobs
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
