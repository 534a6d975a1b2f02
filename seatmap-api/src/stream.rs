use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use seatmap_core::{Delivery, Subscription};
use seatmap_shared::{EventId, SeatChange, SeatUpdateMessage};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};

use crate::metrics::SeatMetrics;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/events/{event_id}/stream", get(stream_event))
}

/// GET /v1/events/{event_id}/stream
///
/// Live seat changes for one event. The client is expected to load
/// `GET /v1/events/{event_id}/seats` alongside and ignore changes whose
/// version is not newer than what it already has.
pub async fn stream_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broadcaster().subscribe(EventId::new(event_id));
    info!(
        "Live stream opened: {} on event {}",
        subscription.handle().id,
        subscription.event_id()
    );

    Sse::new(live_updates(subscription, state.metrics.clone()))
        .keep_alive(KeepAlive::new().interval(state.keepalive).text("ping"))
}

/// Greeting, then one `seat` event per delivered change. Ends when the
/// subscription is cancelled; dropping the stream cancels it.
pub fn live_updates(
    subscription: Subscription,
    metrics: Arc<SeatMetrics>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let greeting = greeting_event(&subscription);

    let updates = stream::unfold((subscription, metrics), |(mut subscription, metrics)| async move {
        loop {
            match subscription.recv().await {
                Some(Delivery::Change(change)) => {
                    if let Some(event) = seat_event(&change) {
                        return Some((Ok(event), (subscription, metrics)));
                    }
                }
                Some(Delivery::Lagged(missed)) => {
                    // The client spots the version gap and re-fetches.
                    debug!("{} fell behind by {} change(s)", subscription.handle().id, missed);
                    metrics.notifications_lagged.inc_by(missed);
                }
                None => {
                    debug!("{} closed", subscription.handle().id);
                    return None;
                }
            }
        }
    });

    stream::once(async move { Ok(greeting) }).chain(updates)
}

fn greeting_event(subscription: &Subscription) -> Event {
    let payload = json!({
        "event_id": subscription.event_id(),
        "subscription_id": subscription.handle().id.to_string(),
    });
    Event::default().event("connected").data(payload.to_string())
}

fn seat_event(change: &SeatChange) -> Option<Event> {
    let message = SeatUpdateMessage::from(change);
    let data = encode(&message)?;
    Some(Event::default().event("seat").id(change.version.to_string()).data(data))
}

/// A payload that cannot be encoded is logged and skipped rather than sent
/// as an empty frame.
fn encode<T: Serialize>(payload: &T) -> Option<String> {
    match serde_json::to_string(payload) {
        Ok(data) => Some(data),
        Err(e) => {
            error!("Failed to encode live update: {}", e);
            None
        }
    }
}
