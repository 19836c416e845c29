//! `GET /event` — SSE stream of every bus event.
//!
//! Wraps a broadcast-backed subscription in an `async_stream::stream!` block
//! that loops until the subscription closes.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_core::Stream;

use crate::app_state::AppState;

pub async fn stream_events(State(state): State<AppState>) -> impl IntoResponse {
    let subscription = state.events.subscribe_all();
    Sse::new(make_event_stream(subscription)).keep_alive(KeepAlive::default())
}

fn make_event_stream(
    mut subscription: sa_engine::EventSubscription,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            let data = serde_json::to_string(&event.properties).unwrap_or_default();
            yield Ok(Event::default().event(event.kind.clone()).data(data));
        }
    }
}
