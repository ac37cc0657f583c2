//! Crawl sessions: discovery, batching and completion tracking.
//!
//! A session moves `pending -> discovering -> crawling -> completed | failed`.
//! Each batch of URLs becomes one queued job; the session finishes once every
//! batch job has reached a terminal status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::discovery::Discoverer;
use crate::error::StoreError;
use crate::models::{
  BatchResult, CrawlBatchPayload, CrawlSession, JobFilter, JobKind, JobPriority, JobStatus,
  SessionPatch, SessionStatus,
};
use crate::progress::{ProgressEvent, SharedProgressSink};
use crate::queue::DistributedCrawlQueue;
use crate::rate_limiter::normalize_domain;

#[derive(Debug, Error)]
pub enum OrchestratorError {
  #[error("invalid crawl request: {0}")]
  InvalidRequest(String),
  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
  pub poll_interval: Duration,
  pub error_backoff: Duration,
  pub small_batch: usize,
  pub default_batch: usize,
  pub large_batch: usize,
  /// Pending jobs above which batches shrink.
  pub busy_queue_depth: i64,
  /// Pending jobs below which batches grow.
  pub idle_queue_depth: i64,
  pub default_max_pages: usize,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(5),
      error_backoff: Duration::from_secs(10),
      small_batch: 5,
      default_batch: 10,
      large_batch: 50,
      busy_queue_depth: 100,
      idle_queue_depth: 10,
      default_max_pages: 100,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlRequest {
  pub parent_source_id: Uuid,
  pub start_url: String,
  /// Explicit list to crawl instead of discovering links.
  #[serde(default)]
  pub urls: Option<Vec<String>>,
  #[serde(default)]
  pub max_pages: Option<usize>,
  #[serde(default)]
  pub priority: Option<JobPriority>,
}

pub struct CrawlOrchestrator {
  queue: Arc<DistributedCrawlQueue>,
  discoverer: Arc<dyn Discoverer>,
  progress: SharedProgressSink,
  config: OrchestratorConfig,
}

impl CrawlOrchestrator {
  pub fn new(
    queue: Arc<DistributedCrawlQueue>,
    discoverer: Arc<dyn Discoverer>,
    progress: SharedProgressSink,
    config: OrchestratorConfig,
  ) -> Self {
    Self { queue, discoverer, progress, config }
  }

  /// Create the session and drive it in the background. Returns once the
  /// session row exists.
  pub async fn initiate_crawl(self: &Arc<Self>, request: CrawlRequest) -> Result<Uuid, OrchestratorError> {
    let domain = validate_start_url(&request.start_url)?;
    if let Some(urls) = &request.urls {
      validate_urls(urls, &domain)?;
    }
    let session = CrawlSession::new(request.parent_source_id, request.start_url.clone(), domain);
    let session_id = session.id;
    self.queue.store().insert_session(&session).await?;
    info!(session_id = %session_id, start_url = %request.start_url, "crawl session created");
    self.publish(&session, "crawl session created");

    let this = self.clone();
    tokio::spawn(async move {
      if this.start_session(session_id, &request).await {
        this.monitor_session(session_id).await;
      }
    });
    Ok(session_id)
  }

  /// Discover and enqueue. Returns whether the session reached `crawling`.
  pub async fn start_session(&self, session_id: Uuid, request: &CrawlRequest) -> bool {
    match self.discover_and_enqueue(session_id, request).await {
      Ok(()) => true,
      Err(message) => {
        self.fail_session(session_id, &message).await;
        false
      }
    }
  }

  async fn discover_and_enqueue(&self, session_id: Uuid, request: &CrawlRequest) -> Result<(), String> {
    let session = self
      .transition(session_id, SessionStatus::Pending, SessionPatch::status(SessionStatus::Discovering))
      .await
      .map_err(|e| e.to_string())?
      .ok_or_else(|| "session is no longer pending".to_string())?;
    self.publish(&session, "discovering urls");

    let max_pages = request.max_pages.unwrap_or(self.config.default_max_pages);
    let urls = match &request.urls {
      Some(urls) => dedupe(urls, max_pages),
      None => self
        .discoverer
        .discover(&request.start_url, max_pages)
        .await
        .map_err(|e| format!("discovery failed: {}", e))?,
    };

    let batch_size = self.calculate_optimal_batch_size().await.map_err(|e| e.to_string())?;
    let batches: Vec<&[String]> = urls.chunks(batch_size).collect();
    let total_batches = batches.len() as u32;
    let domain = session.domain().unwrap_or_default().to_string();
    for (index, chunk) in batches.iter().enumerate() {
      let payload = CrawlBatchPayload {
        session_id,
        parent_source_id: session.parent_source_id,
        domain: domain.clone(),
        urls: chunk.to_vec(),
        batch_index: index as u32,
        total_batches,
      };
      self
        .queue
        .enqueue_crawl_batch(payload, request.priority)
        .await
        .map_err(|e| format!("enqueue failed: {}", e))?;
    }

    let patch = SessionPatch {
      total_pages: Some(urls.len() as i32),
      total_batches: Some(total_batches as i32),
      ..SessionPatch::status(SessionStatus::Crawling)
    };
    let session = self
      .transition(session_id, SessionStatus::Discovering, patch)
      .await
      .map_err(|e| e.to_string())?
      .ok_or_else(|| "session left discovering unexpectedly".to_string())?;
    info!(session_id = %session_id, urls = urls.len(), batches = total_batches, batch_size, "crawl batches queued");
    self.publish(&session, &format!("queued {} urls in {} batches", urls.len(), total_batches));
    Ok(())
  }

  /// Smaller batches when the queue is busy, larger when it is idle.
  pub async fn calculate_optimal_batch_size(&self) -> Result<usize, StoreError> {
    let depth = self.queue.queue_depth().await?;
    let size = if depth > self.config.busy_queue_depth {
      self.config.small_batch
    } else if depth < self.config.idle_queue_depth {
      self.config.large_batch
    } else {
      self.config.default_batch
    };
    Ok(size.max(1))
  }

  /// Poll until the session is terminal. Store errors back off and retry.
  pub async fn monitor_session(&self, session_id: Uuid) -> Option<SessionStatus> {
    loop {
      match self.poll_session(session_id).await {
        Ok(Some(status)) => return Some(status),
        Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
        Err(StoreError::NotFound(_)) => {
          warn!(session_id = %session_id, "monitored session disappeared");
          return None;
        }
        Err(e) => {
          error!(session_id = %session_id, error = %e, "session poll failed");
          tokio::time::sleep(self.config.error_backoff).await;
        }
      }
    }
  }

  /// One monitoring step: refresh counters, finish the session when every
  /// batch is terminal. Returns the terminal status once reached.
  pub async fn poll_session(&self, session_id: Uuid) -> Result<Option<SessionStatus>, StoreError> {
    let session = self
      .get_session(session_id)
      .await?
      .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
    if session.status.is_terminal() {
      return Ok(Some(session.status));
    }
    if session.status != SessionStatus::Crawling {
      return Ok(None);
    }

    let filter = JobFilter::default().session(session_id).kind(JobKind::CrawlBatch);
    let jobs = self.queue.store().query_jobs(&filter).await?;
    let (mut processed, mut failed_pages, mut completed, mut failed) = (0, 0, 0, 0);
    for job in &jobs {
      match job.status {
        JobStatus::Completed => {
          completed += 1;
          let result: BatchResult = job
            .result
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
          processed += result.succeeded() as i32;
          failed_pages += result.failed() as i32;
        }
        JobStatus::Failed | JobStatus::DeadLetter => {
          failed += 1;
          failed_pages += job.payload.batch_size() as i32;
        }
        _ => {}
      }
    }
    let mut patch = SessionPatch {
      processed_pages: Some(processed),
      failed_pages: Some(failed_pages),
      completed_batches: Some(completed),
      failed_batches: Some(failed),
      ..Default::default()
    };

    let finished = completed + failed >= session.total_batches;
    if finished {
      patch.status = Some(SessionStatus::Completed);
      patch.completed_at = Some(Some(Utc::now()));
      let mut metadata = session.metadata.clone();
      if let Some(map) = metadata.as_object_mut() {
        map.insert("partial".into(), serde_json::Value::Bool(failed > 0));
      }
      patch.metadata = Some(metadata);
    }

    let Some(updated) = self.transition(session_id, SessionStatus::Crawling, patch).await? else {
      // someone else finished or failed it in the meantime
      return Ok(self.get_session(session_id).await?.map(|s| s.status).filter(|s| s.is_terminal()));
    };
    if finished {
      info!(
        session_id = %session_id,
        completed_batches = completed,
        failed_batches = failed,
        partial = failed > 0,
        "crawl session completed"
      );
      let message = if failed > 0 {
        format!("completed with {} of {} batches failed", failed, session.total_batches)
      } else {
        "completed".to_string()
      };
      self.publish(&updated, &message);
      return Ok(Some(SessionStatus::Completed));
    }
    self.publish(&updated, &format!("{}/{} batches done", completed + failed, session.total_batches));
    Ok(None)
  }

  pub async fn get_session(&self, session_id: Uuid) -> Result<Option<CrawlSession>, StoreError> {
    self.queue.store().get_session(session_id).await
  }

  /// After a restart: resume monitors for crawling sessions and fail those
  /// interrupted mid-discovery. Returns how many monitors were resumed.
  pub async fn resume_active_sessions(self: &Arc<Self>) -> Result<usize, StoreError> {
    let interrupted = self
      .queue
      .store()
      .list_sessions(&[SessionStatus::Pending, SessionStatus::Discovering])
      .await?;
    for session in interrupted {
      self.fail_session(session.id, "interrupted before batches were queued").await;
    }

    let active = self.queue.store().list_sessions(&[SessionStatus::Crawling]).await?;
    for session in &active {
      let this = self.clone();
      let id = session.id;
      tokio::spawn(async move {
        this.monitor_session(id).await;
      });
    }
    if !active.is_empty() {
      info!(sessions = active.len(), "resumed crawl session monitors");
    }
    Ok(active.len())
  }

  async fn transition(
    &self,
    session_id: Uuid,
    from: SessionStatus,
    patch: SessionPatch,
  ) -> Result<Option<CrawlSession>, StoreError> {
    if let Some(next) = patch.status {
      if next != from && !from.can_transition_to(next) {
        return Ok(None);
      }
    }
    if !self.queue.store().update_session(session_id, &[from], patch).await? {
      return Ok(None);
    }
    self.get_session(session_id).await
  }

  async fn fail_session(&self, session_id: Uuid, message: &str) {
    let patch = SessionPatch {
      error_message: Some(Some(message.to_string())),
      completed_at: Some(Some(Utc::now())),
      ..SessionPatch::status(SessionStatus::Failed)
    };
    let active = [SessionStatus::Pending, SessionStatus::Discovering, SessionStatus::Crawling];
    match self.queue.store().update_session(session_id, &active, patch).await {
      Ok(true) => {
        warn!(session_id = %session_id, error = message, "crawl session failed");
        if let Ok(Some(session)) = self.get_session(session_id).await {
          self.publish(&session, message);
        }
      }
      Ok(false) => {}
      Err(e) => error!(session_id = %session_id, error = %e, "could not mark session failed"),
    }
  }

  fn publish(&self, session: &CrawlSession, message: &str) {
    let event = ProgressEvent::session(session.id, session.status.as_str(), session.percent_complete(), message)
      .with_metadata(serde_json::json!({
        "total_pages": session.total_pages,
        "processed_pages": session.processed_pages,
        "failed_pages": session.failed_pages,
        "total_batches": session.total_batches,
        "completed_batches": session.completed_batches,
        "failed_batches": session.failed_batches,
      }));
    self.progress.publish(event);
  }
}

fn validate_start_url(start_url: &str) -> Result<String, OrchestratorError> {
  let url = Url::parse(start_url).map_err(|e| OrchestratorError::InvalidRequest(format!("start_url: {}", e)))?;
  if !matches!(url.scheme(), "http" | "https") {
    return Err(OrchestratorError::InvalidRequest("start_url must be http or https".into()));
  }
  url
    .host_str()
    .map(str::to_ascii_lowercase)
    .ok_or_else(|| OrchestratorError::InvalidRequest("start_url has no host".into()))
}

/// Every batch leases the session domain, so explicit URLs must stay on it.
fn validate_urls(urls: &[String], domain: &str) -> Result<(), OrchestratorError> {
  if urls.is_empty() {
    return Err(OrchestratorError::InvalidRequest("urls must not be empty".into()));
  }
  let domain = normalize_domain(domain);
  for raw in urls {
    let url = Url::parse(raw).map_err(|e| OrchestratorError::InvalidRequest(format!("url '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(OrchestratorError::InvalidRequest(format!("url '{}' must be http or https", raw)));
    }
    if url.host_str().map(normalize_domain).as_deref() != Some(domain.as_str()) {
      return Err(OrchestratorError::InvalidRequest(format!("url '{}' is not on {}", raw, domain)));
    }
  }
  Ok(())
}

fn dedupe(urls: &[String], max_pages: usize) -> Vec<String> {
  let mut seen = std::collections::HashSet::new();
  urls.iter().filter(|u| seen.insert(u.as_str())).take(max_pages).cloned().collect()
}
