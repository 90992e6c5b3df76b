use std::sync::Arc;

use chrono::Utc;
use tracing_subscriber::EnvFilter;

use billing_validate::{
    config::AppConfig,
    db,
    services::{
        files::FileStore, heartbeat::HeartbeatMonitor, queue::JobQueue, rules::RuleEngine,
        worker::WorkerPool,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting billing validation worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let files = FileStore::new(&config.upload_dir);
    files
        .init()
        .await
        .expect("Failed to initialize upload directory");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    let engine = RuleEngine::with_default_rules(
        config.amount_ceiling,
        config.claim_window_days,
        Utc::now().date_naive(),
    );

    // Liveness heartbeat: lets external monitors tell "idle" from "dead"
    let monitor =
        HeartbeatMonitor::new(&config.redis_url).expect("Failed to initialize heartbeat monitor");
    let heartbeat = monitor.start();

    let pool = Arc::new(WorkerPool::new(
        db_pool,
        Arc::new(queue),
        Arc::new(files),
        Arc::new(engine),
        config.worker_concurrency,
    ));

    tracing::info!(
        concurrency = config.worker_concurrency,
        "worker ready, starting job processing loop"
    );
    let handles = pool.start();

    // Run until interrupted, then drain gracefully.
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");

    tracing::info!("Shutdown signal received, stopping workers");
    handles.stop().await;
    heartbeat.stop();
    tracing::info!("Worker shut down cleanly");
}
