use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;
use uuid::Uuid;
use warp::Filter;
use warp::sse::Event;

use super::{ApiState, with_state};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct SseQuery {
  pub session_id: Uuid,
}

pub fn sse_route(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<SseQuery>())
    .and(with_state(state))
    .map(|query: SseQuery, state: ApiState| {
      warp::sse::reply(warp::sse::keep_alive().stream(session_events(state, query.session_id, POLL_INTERVAL)))
    })
}

/// One `progress` event per poll; the stream ends after the session turns
/// terminal or disappears.
fn session_events(
  state: ApiState,
  session_id: Uuid,
  every: Duration,
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static {
  let finished = Arc::new(AtomicBool::new(false));
  IntervalStream::new(tokio::time::interval(every))
    .then(move |_| {
      let state = state.clone();
      let finished = finished.clone();
      async move {
        if finished.load(Ordering::Relaxed) {
          return None;
        }
        let event = match state.orchestrator.get_session(session_id).await {
          Ok(Some(session)) => {
            if session.status.is_terminal() {
              finished.store(true, Ordering::Relaxed);
            }
            let data = json!({
              "session_id": session.id,
              "status": session.status,
              "percent": session.percent_complete(),
              "processed_pages": session.processed_pages,
              "failed_pages": session.failed_pages,
              "total_pages": session.total_pages,
              "error": session.error_message,
            });
            Event::default().event("progress").data(data.to_string())
          }
          Ok(None) => {
            finished.store(true, Ordering::Relaxed);
            Event::default().event("error").data(json!({ "error": "session not found" }).to_string())
          }
          Err(e) => {
            warn!(session_id = %session_id, error = %e, "sse session poll failed");
            Event::default().event("error").data(json!({ "error": "temporarily unavailable" }).to_string())
          }
        };
        Some(event)
      }
    })
    .take_while(Option::is_some)
    .filter_map(|event| event.map(Ok::<Event, Infallible>))
}
