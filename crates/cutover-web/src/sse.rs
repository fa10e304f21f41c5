//! Server-Sent Events for live migration updates.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use cutover_engine::{MigrationState, MigrationView};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

/// Stream the state changes of one migration as `state` events.
///
/// Lagging subscribers skip the missed updates; the next event carries the
/// full view anyway.
pub fn migration_events(
    rx: broadcast::Receiver<MigrationState>,
    id: String,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(rx).filter_map(
        move |result: Result<MigrationState, BroadcastStreamRecvError>| {
            let state = match result {
                Ok(state) => state,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(migration = %id, skipped, "event subscriber lagged");
                    return None;
                }
            };
            if state.id != id {
                return None;
            }
            let view = MigrationView::new(&state, None);
            let data = serde_json::to_string(&view).ok()?;
            Some(Ok(Event::default().event("state").data(data)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}
