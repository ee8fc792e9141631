use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

use super::ApiError;
use crate::metrics::SSE_CONNECTIONS_ACTIVE;
use crate::models::UpdateEvent;
use crate::services::AppState;
use crate::AttemptSyncService;

/// Keeps the subscriber gauge honest however the stream ends.
struct SubscriberGuard;

impl SubscriberGuard {
    fn new() -> Self {
        SSE_CONNECTIONS_ACTIVE.inc();
        SubscriberGuard
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        SSE_CONNECTIONS_ACTIVE.dec();
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub connection_id: Option<String>,
}

/// Connection kept alive by the stream's heartbeats.
struct Keepalive {
    sync: AttemptSyncService,
    connection_id: String,
}

struct StreamState {
    attempt_id: String,
    updates: broadcast::Receiver<UpdateEvent>,
    heartbeat: Duration,
    keepalive: Option<Keepalive>,
    _guard: SubscriberGuard,
}

impl StreamState {
    fn touch_connection(&self) {
        let Some(keepalive) = &self.keepalive else {
            return;
        };
        if !keepalive
            .sync
            .touch_connection(&self.attempt_id, &keepalive.connection_id)
        {
            tracing::debug!(
                "Connection {} on attempt {} is gone, heartbeat not counted",
                keepalive.connection_id,
                self.attempt_id
            );
        }
    }
}

/// SSE endpoint for attempt updates
/// GET /api/v1/attempts/{id}/stream?connection_id=...
pub async fn attempt_stream(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 before subscribing
    state.sync.get_state(&attempt_id).await?;

    tracing::info!(
        "Client subscribed to updates: attempt={} connection={:?}",
        attempt_id,
        params.connection_id
    );
    let keepalive = params.connection_id.map(|connection_id| Keepalive {
        sync: state.sync.clone(),
        connection_id,
    });
    let stream = create_update_stream(StreamState {
        updates: state.sync.subscribe(&attempt_id),
        heartbeat: state.sync.heartbeat_interval(),
        attempt_id,
        keepalive,
        _guard: SubscriberGuard::new(),
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_event(update: &UpdateEvent) -> Event {
    Event::default()
        .event(update.event_name())
        .data(update.to_sse_data())
}

/// Forwards published updates and emits a heartbeat whenever the channel is
/// quiet for one interval. Each heartbeat counts as activity on the
/// subscribing connection.
fn create_update_stream(state: StreamState) -> impl Stream<Item = Result<Event, Infallible>> {
    state.touch_connection();
    stream::unfold(state, |mut state| async move {
        loop {
            tokio::select! {
                received = state.updates.recv() => match received {
                    Ok(update) => return Some((Ok(to_event(&update)), state)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Subscriber for attempt {} lagged, {} updates skipped",
                            state.attempt_id,
                            skipped
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = tokio::time::sleep(state.heartbeat) => {
                    state.touch_connection();
                    let heartbeat = UpdateEvent::heartbeat(state.attempt_id.as_str());
                    return Some((Ok(to_event(&heartbeat)), state));
                }
            }
        }
    })
}
