use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, StoreError};
use crate::models::{CrawlBatchPayload, Job, JobFilter, JobPatch, JobPayload, JobPriority, JobStatus, NewJob};
use crate::store::{JobStore, chrono_ttl};

#[derive(Debug, Clone)]
pub struct QueueConfig {
  pub max_attempts: i32,
  /// Global ceiling on processing jobs honored by `get_next_job`.
  pub max_processing: Option<i64>,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
  pub high_priority_max_batch: usize,
  pub normal_priority_max_batch: usize,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      max_processing: Some(10),
      backoff_base: Duration::from_secs(1),
      backoff_max: Duration::from_secs(3600),
      high_priority_max_batch: 5,
      normal_priority_max_batch: 20,
    }
  }
}

/// `base * 2^attempts`, capped at `max`.
pub fn backoff_delay(attempts: i32, base: Duration, max: Duration) -> Duration {
  let exponent = attempts.clamp(0, 30) as u32;
  base.checked_mul(1u32 << exponent).map_or(max, |delay| delay.min(max))
}

pub(crate) fn dead_letter_patch(attempts: i32, reason: &str, kind: ErrorKind) -> JobPatch {
  JobPatch::default()
    .with_status(JobStatus::DeadLetter)
    .with_attempts(attempts)
    .with_completed_at(Some(Utc::now()))
    .with_error(Some(reason.to_string()), Some(kind))
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
  Retrying { attempts: i32, retry_at: chrono::DateTime<Utc> },
  Failed { attempts: i32 },
  /// The job was no longer processing; nothing was written.
  Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
  Requeued,
  DeadLettered,
  Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
  pub pending: i64,
  pub processing: i64,
  pub completed: i64,
  pub failed: i64,
  pub dead_letter: i64,
}

/// Enqueue/dequeue API over the shared job store.
pub struct DistributedCrawlQueue {
  store: Arc<dyn JobStore>,
  config: QueueConfig,
}

impl DistributedCrawlQueue {
  pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
    Self { store, config }
  }

  pub fn store(&self) -> &Arc<dyn JobStore> {
    &self.store
  }

  pub fn config(&self) -> &QueueConfig {
    &self.config
  }

  pub fn backoff(&self, attempts: i32) -> Duration {
    backoff_delay(attempts, self.config.backoff_base, self.config.backoff_max)
  }

  /// Small batches finish quickly, so they jump ahead; large ones take the
  /// caller's hint.
  pub fn calculate_priority(&self, batch_size: usize, requested: Option<JobPriority>) -> JobPriority {
    if batch_size <= self.config.high_priority_max_batch {
      JobPriority::High
    } else if batch_size <= self.config.normal_priority_max_batch {
      JobPriority::Normal
    } else {
      requested.unwrap_or(JobPriority::Low)
    }
  }

  pub async fn enqueue_crawl_batch(
    &self,
    batch: CrawlBatchPayload,
    requested: Option<JobPriority>,
  ) -> Result<Uuid, StoreError> {
    let priority = self.calculate_priority(batch.urls.len(), requested);
    let session_id = batch.session_id;
    let batch_index = batch.batch_index;
    let id = self.enqueue(JobPayload::CrawlBatch(batch), priority).await?;
    info!(job_id = %id, session_id = %session_id, batch_index, priority = ?priority, "crawl batch enqueued");
    Ok(id)
  }

  pub async fn enqueue(&self, payload: JobPayload, priority: JobPriority) -> Result<Uuid, StoreError> {
    let job = NewJob::new(payload)
      .with_priority(priority.value())
      .with_max_attempts(self.config.max_attempts);
    self.store.insert_job(job).await
  }

  /// Claim the most urgent eligible job, or nothing. Safe under concurrent callers.
  pub async fn get_next_job(&self) -> Result<Option<Job>, StoreError> {
    let mut jobs = self.store.claim_next_pending(1, self.config.max_processing).await?;
    Ok(jobs.pop())
  }

  pub async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
    self.store.claim_job(id).await
  }

  /// Returns false when the job was already terminal; the first completion wins.
  pub async fn complete_job(&self, id: Uuid, result: serde_json::Value) -> Result<bool, StoreError> {
    let patch = JobPatch::default()
      .with_status(JobStatus::Completed)
      .with_completed_at(Some(Utc::now()))
      .with_result(Some(result))
      .with_error(None, None);
    let updated = self
      .store
      .update_conditional(id, &[JobStatus::Pending, JobStatus::Processing, JobStatus::Failed], patch)
      .await?;
    if updated {
      info!(job_id = %id, "job completed");
    }
    Ok(updated)
  }

  pub async fn fail_job(&self, id: Uuid, error: &str, should_retry: bool) -> Result<FailOutcome, StoreError> {
    let kind = if should_retry { ErrorKind::Retryable } else { ErrorKind::NonRetryable };
    self.fail_job_with_kind(id, error, kind).await
  }

  pub async fn fail_job_with_kind(&self, id: Uuid, error: &str, kind: ErrorKind) -> Result<FailOutcome, StoreError> {
    let job = self
      .store
      .get_job(id)
      .await?
      .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
    if job.status != JobStatus::Processing {
      return Ok(FailOutcome::Ignored);
    }

    let attempts = job.attempts + 1;
    let now = Utc::now();
    if kind.should_retry() && attempts < job.max_attempts {
      let retry_at = now + chrono_ttl(self.backoff(attempts));
      let patch = JobPatch::default()
        .with_status(JobStatus::Pending)
        .with_attempts(attempts)
        .with_scheduled_at(retry_at)
        .with_started_at(None)
        .with_error(Some(error.to_string()), Some(kind));
      if !self.store.update_conditional_attempts(id, &[JobStatus::Processing], job.attempts, patch).await? {
        return Ok(FailOutcome::Ignored);
      }
      warn!(job_id = %id, attempts, retry_at = %retry_at, error, "job failed, retry scheduled");
      Ok(FailOutcome::Retrying { attempts, retry_at })
    } else {
      let patch = JobPatch::default()
        .with_status(JobStatus::Failed)
        .with_attempts(attempts)
        .with_completed_at(Some(now))
        .with_error(Some(error.to_string()), Some(kind));
      if !self.store.update_conditional_attempts(id, &[JobStatus::Processing], job.attempts, patch).await? {
        return Ok(FailOutcome::Ignored);
      }
      warn!(job_id = %id, attempts, error, "job failed permanently");
      Ok(FailOutcome::Failed { attempts })
    }
  }

  /// Hand a claimed job back without spending an attempt.
  pub async fn defer_job(&self, id: Uuid, delay: Duration) -> Result<bool, StoreError> {
    let patch = JobPatch::default()
      .with_status(JobStatus::Pending)
      .with_scheduled_at(Utc::now() + chrono_ttl(delay))
      .with_started_at(None);
    self.store.update_conditional(id, &[JobStatus::Processing], patch).await
  }

  /// Retry-or-bury for a processing job whose worker went silent.
  pub async fn recover_stalled(&self, job: &Job, reason: &str) -> Result<StallAction, StoreError> {
    let attempts = job.attempts + 1;
    let (patch, action) = if attempts >= job.max_attempts {
      (dead_letter_patch(attempts, reason, ErrorKind::Stalled), StallAction::DeadLettered)
    } else {
      let patch = JobPatch::default()
        .with_status(JobStatus::Pending)
        .with_attempts(attempts)
        .with_scheduled_at(Utc::now() + chrono_ttl(self.backoff(attempts)))
        .with_started_at(None)
        .with_error(Some(reason.to_string()), Some(ErrorKind::Stalled));
      (patch, StallAction::Requeued)
    };
    if !self.store.update_conditional_attempts(job.id, &[JobStatus::Processing], job.attempts, patch).await? {
      return Ok(StallAction::Skipped);
    }
    warn!(job_id = %job.id, attempts, action = ?action, reason, "stalled job recovered");
    Ok(action)
  }

  pub async fn queue_depth(&self) -> Result<i64, StoreError> {
    self.store.count_jobs(&JobFilter::status(JobStatus::Pending)).await
  }

  pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
    let mut counts = StatusCounts::default();
    for status in JobStatus::ALL {
      let count = self.store.count_jobs(&JobFilter::status(status)).await?;
      match status {
        JobStatus::Pending => counts.pending = count,
        JobStatus::Processing => counts.processing = count,
        JobStatus::Completed => counts.completed = count,
        JobStatus::Failed => counts.failed = count,
        JobStatus::DeadLetter => counts.dead_letter = count,
      }
    }
    Ok(counts)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{CrawlSession, DomainLock, SessionPatch, SessionStatus};
  use crate::store::MemoryJobStore;
  use tokio_test::assert_ok;

  fn batch(urls: usize) -> CrawlBatchPayload {
    CrawlBatchPayload {
      session_id: Uuid::new_v4(),
      parent_source_id: Uuid::new_v4(),
      domain: "example.com".into(),
      urls: (0..urls).map(|i| format!("https://example.com/page/{}", i)).collect(),
      batch_index: 0,
      total_batches: 1,
    }
  }

  fn queue(max_attempts: i32) -> DistributedCrawlQueue {
    let config = QueueConfig { max_attempts, ..Default::default() };
    DistributedCrawlQueue::new(Arc::new(MemoryJobStore::new()), config)
  }

  #[test]
  fn priority_follows_batch_size() {
    let q = queue(3);
    assert_eq!(q.calculate_priority(3, Some(JobPriority::Background)), JobPriority::High);
    assert_eq!(q.calculate_priority(5, None), JobPriority::High);
    assert_eq!(q.calculate_priority(20, None), JobPriority::Normal);
    assert_eq!(q.calculate_priority(21, None), JobPriority::Low);
    assert_eq!(q.calculate_priority(50, Some(JobPriority::Normal)), JobPriority::Normal);
  }

  #[test]
  fn backoff_doubles_and_caps() {
    let base = Duration::from_secs(1);
    let max = Duration::from_secs(60);
    assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
    assert_eq!(backoff_delay(2, base, max), Duration::from_secs(4));
    assert_eq!(backoff_delay(3, base, max), Duration::from_secs(8));
    assert_eq!(backoff_delay(10, base, max), max);
    assert_eq!(backoff_delay(400, base, max), max);
  }

  #[tokio::test]
  async fn enqueue_writes_a_pending_row() {
    let q = queue(3);
    let id = assert_ok!(q.enqueue_crawl_batch(batch(3), None).await);
    let job = q.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.priority, JobPriority::High.value());
    assert_eq!(q.queue_depth().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn retry_delays_grow_exponentially() {
    let q = queue(10);
    let id = q.enqueue_crawl_batch(batch(1), None).await.unwrap();
    let mut delays = Vec::new();
    for _ in 0..4 {
      assert!(q.claim_job(id).await.unwrap().is_some());
      let before = Utc::now();
      match q.fail_job(id, "connection reset", true).await.unwrap() {
        FailOutcome::Retrying { retry_at, .. } => delays.push((retry_at - before).num_milliseconds()),
        other => panic!("expected retry, got {:?}", other),
      }
    }
    for (i, delay) in delays.iter().enumerate() {
      let expected = 2_i64.pow(i as u32 + 1) * 1000;
      assert!(*delay >= expected - 50 && *delay <= expected + 1000, "delay {} vs {}", delay, expected);
    }
    assert!(delays.windows(2).all(|w| w[1] > w[0]));
  }

  #[tokio::test]
  async fn always_failing_job_stops_after_max_attempts() {
    let q = queue(3);
    let id = q.enqueue_crawl_batch(batch(2), None).await.unwrap();
    let mut executions = 0;
    while q.claim_job(id).await.unwrap().is_some() {
      executions += 1;
      q.fail_job(id, "upstream 503", true).await.unwrap();
    }
    let job = q.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(executions, 3);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message.as_deref(), Some("upstream 503"));
  }

  #[tokio::test]
  async fn non_retryable_failure_is_terminal_immediately() {
    let q = queue(3);
    let id = q.enqueue_crawl_batch(batch(2), None).await.unwrap();
    q.claim_job(id).await.unwrap();
    assert_eq!(q.fail_job(id, "malformed url", false).await.unwrap(), FailOutcome::Failed { attempts: 1 });
    assert_eq!(q.fail_job(id, "again", false).await.unwrap(), FailOutcome::Ignored);
  }

  #[tokio::test]
  async fn second_completion_keeps_first_timestamp() {
    let q = queue(3);
    let id = q.enqueue_crawl_batch(batch(1), None).await.unwrap();
    q.get_next_job().await.unwrap().unwrap();
    assert!(q.complete_job(id, serde_json::json!({"pages": []})).await.unwrap());
    let first = q.store().get_job(id).await.unwrap().unwrap().completed_at;

    assert!(!assert_ok!(q.complete_job(id, serde_json::json!({"pages": [1]})).await));
    let job = q.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.completed_at, first);
    assert_eq!(job.result, Some(serde_json::json!({"pages": []})));
  }

  #[tokio::test]
  async fn deferring_does_not_spend_an_attempt() {
    let q = queue(3);
    let id = q.enqueue_crawl_batch(batch(1), None).await.unwrap();
    q.claim_job(id).await.unwrap();
    assert!(q.defer_job(id, Duration::from_millis(10)).await.unwrap());
    let job = q.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.started_at, None);
  }

  /// Lets recovery requeue and another worker reclaim a job right after the
  /// first `get_job` read, the window between a failure's read and its write.
  struct InterleavingStore {
    inner: MemoryJobStore,
    raced: std::sync::atomic::AtomicBool,
  }

  #[async_trait::async_trait]
  impl JobStore for InterleavingStore {
    async fn insert_job(&self, job: NewJob) -> crate::store::StoreResult<Uuid> {
      self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> crate::store::StoreResult<Option<Job>> {
      let read = self.inner.get_job(id).await?;
      if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
        if let Some(job) = &read {
          let requeue = JobPatch::default().with_status(JobStatus::Pending).with_attempts(job.attempts + 1);
          self.inner.update_conditional(id, &[JobStatus::Processing], requeue).await?;
          self.inner.claim_job(id).await?;
        }
      }
      Ok(read)
    }

    async fn claim_next_pending(&self, limit: i64, max_processing: Option<i64>) -> crate::store::StoreResult<Vec<Job>> {
      self.inner.claim_next_pending(limit, max_processing).await
    }

    async fn claim_job(&self, id: Uuid) -> crate::store::StoreResult<Option<Job>> {
      self.inner.claim_job(id).await
    }

    async fn update_conditional(&self, id: Uuid, expected: &[JobStatus], patch: JobPatch) -> crate::store::StoreResult<bool> {
      self.inner.update_conditional(id, expected, patch).await
    }

    async fn update_conditional_attempts(
      &self,
      id: Uuid,
      expected: &[JobStatus],
      attempts: i32,
      patch: JobPatch,
    ) -> crate::store::StoreResult<bool> {
      self.inner.update_conditional_attempts(id, expected, attempts, patch).await
    }

    async fn query_jobs(&self, filter: &JobFilter) -> crate::store::StoreResult<Vec<Job>> {
      self.inner.query_jobs(filter).await
    }

    async fn count_jobs(&self, filter: &JobFilter) -> crate::store::StoreResult<i64> {
      self.inner.count_jobs(filter).await
    }

    async fn delete_jobs(&self, filter: &JobFilter) -> crate::store::StoreResult<u64> {
      self.inner.delete_jobs(filter).await
    }

    async fn try_acquire_lock(
      &self,
      domain: &str,
      worker_id: &str,
      max_concurrent: i64,
      ttl: Duration,
    ) -> crate::store::StoreResult<Option<DomainLock>> {
      self.inner.try_acquire_lock(domain, worker_id, max_concurrent, ttl).await
    }

    async fn release_lock(&self, lock_id: Uuid) -> crate::store::StoreResult<bool> {
      self.inner.release_lock(lock_id).await
    }

    async fn renew_lock(&self, lock_id: Uuid, ttl: Duration) -> crate::store::StoreResult<bool> {
      self.inner.renew_lock(lock_id, ttl).await
    }

    async fn active_locks(&self, domain: &str) -> crate::store::StoreResult<Vec<DomainLock>> {
      self.inner.active_locks(domain).await
    }

    async fn delete_expired_locks(&self) -> crate::store::StoreResult<u64> {
      self.inner.delete_expired_locks().await
    }

    async fn insert_session(&self, session: &CrawlSession) -> crate::store::StoreResult<()> {
      self.inner.insert_session(session).await
    }

    async fn get_session(&self, id: Uuid) -> crate::store::StoreResult<Option<CrawlSession>> {
      self.inner.get_session(id).await
    }

    async fn update_session(
      &self,
      id: Uuid,
      expected: &[SessionStatus],
      patch: SessionPatch,
    ) -> crate::store::StoreResult<bool> {
      self.inner.update_session(id, expected, patch).await
    }

    async fn list_sessions(&self, statuses: &[SessionStatus]) -> crate::store::StoreResult<Vec<CrawlSession>> {
      self.inner.list_sessions(statuses).await
    }
  }

  #[tokio::test]
  async fn failure_after_a_concurrent_requeue_and_reclaim_is_ignored() {
    let inner = MemoryJobStore::new();
    let id = inner.insert_job(NewJob::new(JobPayload::CrawlBatch(batch(1)))).await.unwrap();
    inner.claim_job(id).await.unwrap();
    let store = Arc::new(InterleavingStore { inner, raced: Default::default() });
    let q = DistributedCrawlQueue::new(store.clone(), QueueConfig::default());

    let outcome = q.fail_job_with_kind(id, "late failure", ErrorKind::Retryable).await.unwrap();
    assert_eq!(outcome, FailOutcome::Ignored);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_message, None);
  }

  #[tokio::test]
  async fn stale_snapshot_cannot_recover_a_reclaimed_job() {
    let q = queue(3);
    let id = q.enqueue_crawl_batch(batch(1), None).await.unwrap();
    let snapshot = q.claim_job(id).await.unwrap().unwrap();
    assert_eq!(q.recover_stalled(&snapshot, "missed heartbeats").await.unwrap(), StallAction::Requeued);
    q.claim_job(id).await.unwrap().unwrap();

    assert_eq!(q.recover_stalled(&snapshot, "missed heartbeats").await.unwrap(), StallAction::Skipped);
    let job = q.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 1);
  }

  #[tokio::test]
  async fn stalled_jobs_requeue_until_budget_runs_out() {
    let q = queue(2);
    let id = q.enqueue_crawl_batch(batch(1), None).await.unwrap();
    let job = q.claim_job(id).await.unwrap().unwrap();
    assert_eq!(q.recover_stalled(&job, "missed heartbeats").await.unwrap(), StallAction::Requeued);
    assert_eq!(q.recover_stalled(&job, "missed heartbeats").await.unwrap(), StallAction::Skipped);

    let job = q.claim_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(q.recover_stalled(&job, "missed heartbeats").await.unwrap(), StallAction::DeadLettered);
    let job = q.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.error_kind, Some(ErrorKind::Stalled));
  }
}
