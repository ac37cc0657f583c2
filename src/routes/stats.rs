use serde_json::json;
use warp::Filter;

use super::{ApiState, internal, with_state};

pub fn stats_route(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("stats")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_stats)
}

async fn handle_stats(state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
  let status_counts = state.queue.status_counts().await.map_err(internal)?;
  let bands = state.starvation.band_statistics().await.map_err(internal)?;
  let dead_letters = state.dead_letter.statistics().await.map_err(internal)?;
  Ok(warp::reply::json(&json!({
    "status_counts": status_counts,
    "bands": bands,
    "dead_letters": dead_letters,
    "scheduling_policy": state.starvation.policy(),
  })))
}

#[cfg(test)]
mod tests {
  use super::super::{routes, test_support};
  use crate::models::{JobPayload, JobPriority};
  use serde_json::json;
  use warp::http::StatusCode;

  #[tokio::test]
  async fn stats_reflect_the_queue() {
    let state = test_support::state();
    for priority in [JobPriority::High, JobPriority::Low] {
      state
        .queue
        .enqueue(JobPayload::Generic { name: "noop".into(), data: json!({}) }, priority)
        .await
        .unwrap();
    }

    let api = routes(state);
    let res = warp::test::request().method("GET").path("/stats").reply(&api).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["status_counts"]["pending"], 2);
    assert_eq!(body["dead_letters"]["total"], 0);
    assert_eq!(body["scheduling_policy"], "priority");
    assert_eq!(body["bands"].as_array().unwrap().len(), 3);
  }
}
