use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    files::FileStore,
    heartbeat::HeartbeatMonitor,
    queue::JobQueue,
    status::StatusService,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub files: Arc<FileStore>,
    pub status: Arc<StatusService>,
    pub heartbeat: Arc<HeartbeatMonitor>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: JobQueue,
        files: FileStore,
        heartbeat: HeartbeatMonitor,
    ) -> Self {
        let queue = Arc::new(queue);
        let status = Arc::new(StatusService::new(db.clone(), Arc::clone(&queue)));

        Self {
            db,
            queue,
            files: Arc::new(files),
            status,
            heartbeat: Arc::new(heartbeat),
        }
    }
}
