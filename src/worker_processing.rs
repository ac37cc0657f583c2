use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, StoreError};
use crate::models::{BatchResult, CrawlBatchPayload, Job, JobPayload, PageResult};
use crate::progress::{ProgressEvent, SharedProgressSink};
use crate::rate_limiter::{DomainLease, DomainRateLimiter};

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
  Completed(Value),
  /// Could not start right now; hand the job back without spending an attempt.
  Deferred(String),
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
  async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedPage {
  pub status_code: u16,
  pub bytes: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("HTTP {status} from {url}")]
  Status { url: String, status: u16 },
  #[error("request to {url} failed: {message}")]
  Request { url: String, message: String },
  #[error("invalid url {0}")]
  InvalidUrl(String),
}

impl FetchError {
  pub fn status_code(&self) -> Option<u16> {
    match self {
      FetchError::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Throttling, server errors and network failures may clear up on retry.
  pub fn is_transient(&self) -> bool {
    match self {
      FetchError::Status { status, .. } => *status == 429 || *status >= 500,
      FetchError::Request { .. } => true,
      FetchError::InvalidUrl(_) => false,
    }
  }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
  async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

pub struct HttpPageFetcher {
  client: reqwest::Client,
}

impl HttpPageFetcher {
  pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("crawlq/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
  async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
    let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    let response = self
      .client
      .get(parsed)
      .send()
      .await
      .map_err(|e| FetchError::Request { url: url.to_string(), message: e.to_string() })?;
    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
    }
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Request { url: url.to_string(), message: e.to_string() })?;
    Ok(FetchedPage { status_code: status.as_u16(), bytes: body.len() as u64 })
  }
}

/// Executes `crawl-batch` jobs: one domain lease per batch, URLs fetched in
/// order with pacing between them.
pub struct CrawlWorker {
  limiter: Arc<DomainRateLimiter>,
  fetcher: Arc<dyn PageFetcher>,
  progress: SharedProgressSink,
  worker_id: String,
  batch_timeout: Duration,
}

impl CrawlWorker {
  pub fn new(
    limiter: Arc<DomainRateLimiter>,
    fetcher: Arc<dyn PageFetcher>,
    progress: SharedProgressSink,
    worker_id: impl Into<String>,
  ) -> Self {
    Self {
      limiter,
      fetcher,
      progress,
      worker_id: worker_id.into(),
      batch_timeout: Duration::from_secs(5 * 60),
    }
  }

  pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
    self.batch_timeout = timeout;
    self
  }

  pub async fn process_batch(&self, job_id: Uuid, batch: &CrawlBatchPayload) -> Result<JobOutcome, JobError> {
    let Some(lease) = self.limiter.acquire_domain_lock(&batch.domain).await? else {
      info!(job_id = %job_id, domain = %batch.domain, "domain at capacity, deferring batch");
      return Ok(JobOutcome::Deferred(format!("domain {} at capacity", batch.domain)));
    };
    debug!(job_id = %job_id, worker_id = %self.worker_id, urls = batch.urls.len(), "batch started");

    let crawled = tokio::select! {
      crawled = tokio::time::timeout(self.batch_timeout, self.crawl_urls(job_id, batch)) => crawled,
      _ = self.keep_lease_alive(&lease) => {
        warn!(job_id = %job_id, domain = %batch.domain, "domain lock lost mid-batch, abandoning");
        Ok(Err(JobError::Transient(format!("lost domain lock for {}", batch.domain))))
      }
    };
    if let Err(e) = lease.release().await {
      warn!(job_id = %job_id, domain = %batch.domain, error = %e, "domain lock release failed, left to expire");
    }

    match crawled {
      Ok(Ok(result)) => {
        info!(
          job_id = %job_id,
          domain = %batch.domain,
          succeeded = result.succeeded(),
          failed = result.failed(),
          "batch finished"
        );
        let value = serde_json::to_value(&result).map_err(StoreError::from)?;
        Ok(JobOutcome::Completed(value))
      }
      Ok(Err(e)) => Err(e),
      Err(_) => Err(JobError::Timeout(self.batch_timeout)),
    }
  }

  /// Renews the lease until it is lost; only returns in that case.
  async fn keep_lease_alive(&self, lease: &DomainLease) {
    let mut ticker = tokio::time::interval(self.limiter.renew_interval());
    ticker.tick().await;
    loop {
      ticker.tick().await;
      match self.limiter.renew_domain_lock(lease).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => warn!(domain = %lease.lock().domain, error = %e, "domain lock renewal failed, retrying"),
      }
    }
  }

  async fn crawl_urls(&self, job_id: Uuid, batch: &CrawlBatchPayload) -> Result<BatchResult, JobError> {
    let total = batch.urls.len();
    let mut result = BatchResult::default();
    let mut transient_failures = 0;

    for (i, url) in batch.urls.iter().enumerate() {
      self.limiter.wait_for_rate_limit(&batch.domain).await;
      let started = Instant::now();
      let page = match self.fetcher.fetch(url).await {
        Ok(page) => PageResult {
          url: url.clone(),
          success: true,
          status_code: Some(page.status_code),
          bytes: Some(page.bytes),
          error: None,
          duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(e) => {
          debug!(job_id = %job_id, url = %url, error = %e, "page fetch failed");
          if e.is_transient() {
            transient_failures += 1;
          }
          PageResult {
            url: url.clone(),
            success: false,
            status_code: e.status_code(),
            bytes: None,
            error: Some(e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
          }
        }
      };
      let success = page.success;
      result.pages.push(page);

      let done = i + 1;
      let percent = (done * 100 / total) as u8;
      self.progress.publish(
        ProgressEvent::job(job_id, "processing", percent, format!("crawled {}/{} urls", done, total)).with_metadata(
          json!({ "session_id": batch.session_id, "url": url, "success": success }),
        ),
      );
    }

    // nothing got through and every failure may clear up: retry the whole batch
    if total > 0 && transient_failures == total {
      return Err(JobError::Transient(format!("all {} urls failed transiently", total)));
    }
    Ok(result)
  }
}

#[async_trait]
impl JobExecutor for CrawlWorker {
  async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
    match &job.payload {
      JobPayload::CrawlBatch(batch) => self.process_batch(job.id, batch).await,
      other => Err(JobError::UnknownJobType(other.kind().to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::NewJob;
  use crate::progress::ChannelProgressSink;
  use crate::rate_limiter::{DomainLimits, RateLimitConfig};
  use crate::store::{JobStore, MemoryJobStore};
  use std::collections::HashMap;

  /// Per-URL scripted responses; unknown URLs succeed.
  #[derive(Default)]
  struct ScriptedFetcher {
    failures: HashMap<String, u16>,
    delay: Duration,
  }

  #[async_trait]
  impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      match self.failures.get(url) {
        Some(status) => Err(FetchError::Status { url: url.to_string(), status: *status }),
        None => Ok(FetchedPage { status_code: 200, bytes: 512 }),
      }
    }
  }

  fn limiter() -> Arc<DomainRateLimiter> {
    let config = RateLimitConfig {
      defaults: DomainLimits { max_concurrent: 1, requests_per_second: 0.0 },
      ..Default::default()
    };
    Arc::new(DomainRateLimiter::new(Arc::new(MemoryJobStore::new()), config, "worker-test"))
  }

  fn batch_job(urls: &[&str]) -> Job {
    let payload = CrawlBatchPayload {
      session_id: Uuid::new_v4(),
      parent_source_id: Uuid::new_v4(),
      domain: "example.com".into(),
      urls: urls.iter().map(|u| u.to_string()).collect(),
      batch_index: 0,
      total_batches: 1,
    };
    NewJob::new(JobPayload::CrawlBatch(payload)).into_job(Uuid::new_v4(), chrono::Utc::now())
  }

  #[tokio::test]
  async fn per_url_failures_are_recorded_not_thrown() {
    let limiter = limiter();
    let fetcher = ScriptedFetcher {
      failures: HashMap::from([("https://example.com/b".to_string(), 404)]),
      ..Default::default()
    };
    let (sink, mut events) = ChannelProgressSink::new();
    let worker = CrawlWorker::new(limiter.clone(), Arc::new(fetcher), Arc::new(sink), "w1");

    let job = batch_job(&["https://example.com/a", "https://example.com/b", "https://example.com/c"]);
    let JobOutcome::Completed(value) = worker.execute(&job).await.unwrap() else {
      panic!("expected completion");
    };
    let result: BatchResult = serde_json::from_value(value).unwrap();
    assert_eq!(result.pages.len(), 3);
    assert_eq!(result.failed(), 1);
    assert_eq!(result.pages[1].status_code, Some(404));

    let mut percents = Vec::new();
    while let Ok(event) = events.try_recv() {
      percents.push(event.percent);
    }
    assert_eq!(percents, vec![33, 66, 100]);
    assert!(limiter.active_locks("example.com").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn lock_is_released_when_the_batch_fails() {
    let limiter = limiter();
    let url = "https://example.com/down";
    let fetcher = ScriptedFetcher { failures: HashMap::from([(url.to_string(), 503)]), ..Default::default() };
    let (sink, _events) = ChannelProgressSink::new();
    let worker = CrawlWorker::new(limiter.clone(), Arc::new(fetcher), Arc::new(sink), "w1");

    let err = worker.execute(&batch_job(&[url])).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(limiter.active_locks("example.com").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn slow_batch_times_out_and_releases_lock() {
    let limiter = limiter();
    let fetcher = ScriptedFetcher { delay: Duration::from_millis(200), ..Default::default() };
    let (sink, _events) = ChannelProgressSink::new();
    let worker = CrawlWorker::new(limiter.clone(), Arc::new(fetcher), Arc::new(sink), "w1")
      .with_batch_timeout(Duration::from_millis(20));

    let err = worker.execute(&batch_job(&["https://example.com/slow"])).await.unwrap_err();
    assert!(matches!(err, JobError::Timeout(_)));
    assert!(limiter.active_locks("example.com").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn batch_longer_than_the_lease_ttl_keeps_the_domain() {
    let store = Arc::new(MemoryJobStore::new());
    let config = RateLimitConfig {
      defaults: DomainLimits { max_concurrent: 1, requests_per_second: 20.0 },
      lease_ttl: Duration::from_millis(100),
      ..Default::default()
    };
    let worker_a = Arc::new(DomainRateLimiter::new(store.clone(), config.clone(), "worker-a"));
    let worker_b = DomainRateLimiter::new(store, config, "worker-b");
    let (sink, _events) = ChannelProgressSink::new();
    let worker = Arc::new(CrawlWorker::new(worker_a, Arc::new(ScriptedFetcher::default()), Arc::new(sink), "worker-a"));

    let urls: Vec<String> = (0..6).map(|i| format!("https://example.com/{}", i)).collect();
    let job = batch_job(&urls.iter().map(String::as_str).collect::<Vec<_>>());
    let running = tokio::spawn({
      let worker = worker.clone();
      async move { worker.execute(&job).await }
    });

    tokio::time::sleep(Duration::from_millis(180)).await;
    assert!(!running.is_finished());
    assert!(worker_b.acquire_domain_lock("example.com").await.unwrap().is_none());

    let JobOutcome::Completed(value) = running.await.unwrap().unwrap() else {
      panic!("expected completion");
    };
    let result: BatchResult = serde_json::from_value(value).unwrap();
    assert_eq!(result.succeeded(), 6);
    assert!(worker_b.acquire_domain_lock("example.com").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn lost_lease_abandons_the_batch() {
    let store = Arc::new(MemoryJobStore::new());
    let config = RateLimitConfig {
      defaults: DomainLimits { max_concurrent: 1, requests_per_second: 0.0 },
      lease_ttl: Duration::from_millis(60),
      ..Default::default()
    };
    let limiter = Arc::new(DomainRateLimiter::new(store.clone(), config, "worker-a"));
    let fetcher = ScriptedFetcher { delay: Duration::from_millis(40), ..Default::default() };
    let (sink, _events) = ChannelProgressSink::new();
    let worker = Arc::new(CrawlWorker::new(limiter.clone(), Arc::new(fetcher), Arc::new(sink), "worker-a"));

    let urls: Vec<String> = (0..10).map(|i| format!("https://example.com/{}", i)).collect();
    let job = batch_job(&urls.iter().map(String::as_str).collect::<Vec<_>>());
    let running = tokio::spawn({
      let worker = worker.clone();
      async move { worker.execute(&job).await }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let held = limiter.active_locks("example.com").await.unwrap();
    assert_eq!(held.len(), 1);
    assert!(store.release_lock(held[0].id).await.unwrap());

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, JobError::Transient(_)));
  }

  #[tokio::test]
  async fn saturated_domain_defers_instead_of_failing() {
    let limiter = limiter();
    let held = limiter.acquire_domain_lock("example.com").await.unwrap().unwrap();
    let (sink, _events) = ChannelProgressSink::new();
    let worker = CrawlWorker::new(limiter.clone(), Arc::new(ScriptedFetcher::default()), Arc::new(sink), "w1");

    let outcome = worker.execute(&batch_job(&["https://example.com/a"])).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Deferred(_)));
    held.release().await.unwrap();
  }

  #[tokio::test]
  async fn generic_jobs_are_rejected() {
    let (sink, _events) = ChannelProgressSink::new();
    let worker = CrawlWorker::new(limiter(), Arc::new(ScriptedFetcher::default()), Arc::new(sink), "w1");
    let job = NewJob::new(JobPayload::Generic { name: "x".into(), data: Value::Null })
      .into_job(Uuid::new_v4(), chrono::Utc::now());
    let err = worker.execute(&job).await.unwrap_err();
    assert!(!err.is_retryable());
  }

  #[test]
  fn fetch_errors_classify_by_status() {
    let status = |status| FetchError::Status { url: "u".into(), status };
    assert!(status(429).is_transient());
    assert!(status(502).is_transient());
    assert!(!status(404).is_transient());
    assert!(!FetchError::InvalidUrl("nope".into()).is_transient());
    assert!(FetchError::Request { url: "u".into(), message: "reset".into() }.is_transient());
  }
}
