use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::{ApiState, internal, reject, with_state};
use crate::orchestrator::{CrawlRequest, OrchestratorError};

#[derive(Serialize)]
pub struct CrawlResponse {
  pub session_id: Uuid,
  pub status: String,
  pub sse_url: String,
}

pub fn create_route(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("crawls")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::content_length_limit(1024 * 1024))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_create)
}

pub fn get_route(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("crawls" / Uuid)
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_get)
}

async fn handle_create(request: CrawlRequest, state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
  let session_id = match state.orchestrator.initiate_crawl(request).await {
    Ok(id) => id,
    Err(OrchestratorError::InvalidRequest(message)) => {
      warn!(error = %message, "crawl request rejected");
      return Err(reject(StatusCode::BAD_REQUEST, message));
    }
    Err(OrchestratorError::Store(e)) => return Err(internal(e)),
  };
  info!(session_id = %session_id, "crawl accepted");
  let response = CrawlResponse {
    session_id,
    status: "pending".into(),
    sse_url: format!("/sse?session_id={}", session_id),
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::ACCEPTED))
}

async fn handle_get(session_id: Uuid, state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
  match state.orchestrator.get_session(session_id).await.map_err(internal)? {
    Some(session) => Ok(warp::reply::json(&session)),
    None => Err(reject(StatusCode::NOT_FOUND, format!("session {} not found", session_id))),
  }
}
