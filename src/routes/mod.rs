use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use crate::dead_letter::DeadLetterQueue;
use crate::orchestrator::CrawlOrchestrator;
use crate::queue::DistributedCrawlQueue;
use crate::starvation::QueueStarvationProtection;

pub mod crawls;
pub mod dead_letters;
pub mod sse;
pub mod stats;

/// Handles shared by every route.
#[derive(Clone)]
pub struct ApiState {
  pub orchestrator: Arc<CrawlOrchestrator>,
  pub queue: Arc<DistributedCrawlQueue>,
  pub starvation: Arc<QueueStarvationProtection>,
  pub dead_letter: Arc<DeadLetterQueue>,
}

pub fn routes(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  crawls::create_route(state.clone())
    .or(crawls::get_route(state.clone()))
    .or(sse::sse_route(state.clone()))
    .or(dead_letters::list_route(state.clone()))
    .or(dead_letters::retry_route(state.clone()))
    .or(stats::stats_route(state))
    .or(health_route())
    .recover(handle_rejection)
}

pub fn health_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .map(|| warp::reply::json(&json!({ "status": "ok" })))
}

pub(crate) fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl warp::reject::Reject for ApiError {}

pub(crate) fn reject(status: StatusCode, message: impl Into<String>) -> warp::Rejection {
  warp::reject::custom(ApiError { status, message: message.into() })
}

pub(crate) fn internal(err: impl std::fmt::Display) -> warp::Rejection {
  error!(error = %err, "request failed");
  reject(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(api) = err.find::<ApiError>() {
    (api.status, api.message.clone())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!(rejection = ?err, "unhandled rejection");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
