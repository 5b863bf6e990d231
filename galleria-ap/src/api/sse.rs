//! Server-Sent Events stream of player events

use crate::api::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("New SSE client connected");

    let stream = BroadcastStream::new(state.handle.subscribe()).filter_map(|result| async move {
        match result {
            Ok(event) => match Event::default()
                .event(event.event_type())
                .id(Uuid::new_v4().to_string())
                .json_data(&event)
            {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    None
                }
            },
            // Lagged clients skip ahead
            Err(e) => {
                warn!("SSE stream error: {:?}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
