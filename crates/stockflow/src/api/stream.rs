use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use tokio_stream::{Stream, StreamExt};

use crate::api::ApiState;

/// GET /events
///
/// Each broadcaster frame becomes one SSE event. When the client goes away
/// axum drops the stream, which drops the subscription and removes the
/// observer.
pub async fn events(State(state): State<ApiState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.events.subscribe(state.observer_buffer);
    tracing::info!(observer_id = %subscription.id(), "event stream opened");

    Sse::new(subscription.map(|frame| Ok(Event::default().event(frame.event).data(frame.data))))
}
