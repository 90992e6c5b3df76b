use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use billing_validate::app_state::AppState;
use billing_validate::config::AppConfig;
use billing_validate::db;
use billing_validate::routes;
use billing_validate::services::{
    files::FileStore, heartbeat::HeartbeatMonitor, queue::JobQueue,
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing billing-validate server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "validation_processing_seconds",
        "Time to process a validation job"
    );
    metrics::describe_counter!(
        "validation_jobs_submitted",
        "Total validation jobs submitted"
    );
    metrics::describe_counter!(
        "validation_jobs_completed",
        "Total validation jobs completed"
    );
    metrics::describe_counter!(
        "validation_jobs_failed",
        "Total validation jobs that exhausted retries"
    );
    metrics::describe_gauge!(
        "validation_queue_depth",
        "Current number of waiting jobs in the queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize upload file store
    let files = FileStore::new(&config.upload_dir);
    files
        .init()
        .await
        .expect("Failed to initialize upload directory");

    // Initialize Redis job queue and heartbeat reader
    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");
    let heartbeat =
        HeartbeatMonitor::new(&config.redis_url).expect("Failed to initialize heartbeat monitor");

    // Create shared application state
    let state = AppState::new(db_pool, queue, files, heartbeat);

    // Periodically export queue depth for scraping
    {
        let queue = Arc::clone(&state.queue);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(15));
            loop {
                ticker.tick().await;
                if let Ok(depth) = queue.queue_depth().await {
                    metrics::gauge!("validation_queue_depth").set(depth as f64);
                }
            }
        });
    }

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/validations", post(routes::validate::submit_validation))
        .route(
            "/api/v1/validations/{id}/status",
            get(routes::validate::get_validation_status),
        )
        .route(
            "/api/v1/validations/{id}/stream",
            get(routes::stream::stream_validation_status),
        )
        .route(
            "/api/v1/validations/{id}/results",
            get(routes::validate::get_validation_results),
        )
        .route(
            "/api/v1/validations/{id}/results/preview",
            get(routes::validate::get_results_preview),
        )
        .route(
            "/api/v1/validations/{id}/cancel",
            post(routes::validate::cancel_validation),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(50 * 1024 * 1024)); // 50 MB limit

    tracing::info!("Starting billing-validate on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
