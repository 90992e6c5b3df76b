use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tracing::{error, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::StreamEvent;
use crate::models::run::RunStatus;

/// Poll cadence of the push channel.
const TICK: Duration = Duration::from_secs(2);

/// Hard safety ceiling bounding unattended subscriptions to ~1 hour.
const MAX_TICKS: u32 = 1800;

enum Phase {
    Connect,
    Polling { remaining: u32 },
    Done,
}

/// GET /api/v1/validations/{id}/stream — server-sent status events.
///
/// Emits `connected`, then one event per tick until the run reaches a
/// terminal state or the safety ceiling trips. The server closes the
/// channel after the terminal or `timeout` event; a client disconnect
/// simply drops the stream.
pub async fn stream_validation_status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    match state.status.run_status(run_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(run_id = %run_id, error = %e, "stream subscription failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let stream = futures::stream::unfold(Phase::Connect, move |phase| {
        let state = state.clone();
        async move {
            match phase {
                Phase::Connect => Some((
                    Ok(to_event(&StreamEvent::Connected {
                        validation_id: run_id,
                    })),
                    Phase::Polling {
                        remaining: MAX_TICKS,
                    },
                )),
                Phase::Polling { remaining } => {
                    if remaining == 0 {
                        return Some((
                            Ok(to_event(&StreamEvent::Timeout {
                                validation_id: run_id,
                            })),
                            Phase::Done,
                        ));
                    }

                    tokio::time::sleep(TICK).await;

                    match state.status.run_status(run_id).await {
                        Ok(Some(status)) => {
                            let (event, next) = match status.status {
                                RunStatus::Completed => {
                                    (StreamEvent::Completed(status), Phase::Done)
                                }
                                RunStatus::Failed => (StreamEvent::Error(status), Phase::Done),
                                _ => (
                                    StreamEvent::Progress(status),
                                    Phase::Polling {
                                        remaining: remaining - 1,
                                    },
                                ),
                            };
                            Some((Ok(to_event(&event)), next))
                        }
                        Ok(None) => None,
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "status read failed mid-stream");
                            Some((
                                Ok(Event::default().comment("status read failed")),
                                Phase::Polling {
                                    remaining: remaining - 1,
                                },
                            ))
                        }
                    }
                }
                Phase::Done => None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_event(event: &StreamEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "failed to serialize stream event");
            Event::default().comment("serialization failure")
        }
    }
}
