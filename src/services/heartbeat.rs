use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::services::queue::QueueError;

const HEARTBEAT_KEY: &str = "billing_validate:worker:heartbeat";

/// Write interval for the liveness signal.
const BEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Key TTL, 4x the write interval so one missed write does not falsely
/// report a stopped worker.
const BEAT_TTL_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLiveness {
    Running,
    Stopped,
}

/// Worker liveness as inferred from the shared heartbeat key.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub status: WorkerLiveness,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
}

/// Periodic liveness signal distinguishing "no jobs to do" from "worker
/// process is dead".
pub struct HeartbeatMonitor {
    client: redis::Client,
}

impl HeartbeatMonitor {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Spawn the background writer. The task beats immediately, then every
    /// interval until aborted via the returned handle.
    pub fn start(&self) -> HeartbeatHandle {
        let client = self.client.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = write_beat(&client).await {
                    warn!(error = %e, "heartbeat write failed");
                }
            }
        });

        HeartbeatHandle { task }
    }

    /// `Stopped` when no heartbeat exists or its age exceeds the TTL window.
    pub async fn status(&self) -> Result<WorkerStatus, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;

        let raw: Option<String> = conn.get(HEARTBEAT_KEY).await.map_err(QueueError::Redis)?;
        let last = raw.and_then(|v| DateTime::parse_from_rfc3339(&v).ok().map(|t| t.with_timezone(&Utc)));

        Ok(status_from(last, Utc::now()))
    }
}

async fn write_beat(client: &redis::Client) -> Result<(), QueueError> {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(QueueError::Redis)?;

    conn.set_ex::<_, _, ()>(HEARTBEAT_KEY, Utc::now().to_rfc3339(), BEAT_TTL_SECS as u64)
        .await
        .map_err(QueueError::Redis)?;
    debug!("heartbeat written");
    Ok(())
}

fn status_from(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> WorkerStatus {
    match last {
        Some(beat) => {
            let age = (now - beat).num_seconds();
            let status = if age > BEAT_TTL_SECS {
                WorkerLiveness::Stopped
            } else {
                WorkerLiveness::Running
            };
            WorkerStatus {
                status,
                last_heartbeat: Some(beat),
                age_seconds: Some(age),
            }
        }
        None => WorkerStatus {
            status: WorkerLiveness::Stopped,
            last_heartbeat: None,
            age_seconds: None,
        },
    }
}

/// Owner of the background writer task; aborts it on stop or drop.
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_beat_reports_stopped() {
        let status = status_from(None, Utc::now());
        assert_eq!(status.status, WorkerLiveness::Stopped);
        assert!(status.last_heartbeat.is_none());
    }

    #[test]
    fn fresh_beat_reports_running() {
        let now = Utc::now();
        let status = status_from(Some(now - chrono::Duration::seconds(45)), now);
        assert_eq!(status.status, WorkerLiveness::Running);
        assert_eq!(status.age_seconds, Some(45));
    }

    #[test]
    fn beat_older_than_ttl_window_reports_stopped() {
        let now = Utc::now();
        let status = status_from(Some(now - chrono::Duration::seconds(121)), now);
        assert_eq!(status.status, WorkerLiveness::Stopped);
    }
}
