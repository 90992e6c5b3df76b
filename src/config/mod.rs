use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue and heartbeat
    pub redis_url: String,

    /// Directory where uploaded billing files are stored until processed
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Number of jobs a worker process executes concurrently
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Billed-amount ceiling above which a line is flagged for review
    #[serde(default = "default_amount_ceiling")]
    pub amount_ceiling: f64,

    /// Days after the service date during which a line may still be billed
    #[serde(default = "default_claim_window_days")]
    pub claim_window_days: i64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_amount_ceiling() -> f64 {
    10_000.0
}

fn default_claim_window_days() -> i64 {
    90
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
