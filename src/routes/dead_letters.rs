use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::{ApiState, internal, reject, with_state};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
  pub limit: Option<i64>,
}

pub fn list_route(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("dead-letters")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<ListQuery>())
    .and(with_state(state))
    .and_then(handle_list)
}

pub fn retry_route(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("dead-letters" / Uuid / "retry")
    .and(warp::post())
    .and(with_state(state))
    .and_then(handle_retry)
}

async fn handle_list(query: ListQuery, state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
  let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
  let jobs = state.dead_letter.list(limit).await.map_err(internal)?;
  Ok(warp::reply::json(&jobs))
}

async fn handle_retry(id: Uuid, state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
  if !state.dead_letter.retry_dead_letter_job(id).await.map_err(internal)? {
    return Err(reject(StatusCode::NOT_FOUND, format!("job {} is not dead-lettered", id)));
  }
  info!(job_id = %id, "dead-lettered job requeued via api");
  Ok(warp::reply::json(&json!({ "job_id": id, "status": "pending" })))
}
