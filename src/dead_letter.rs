//! Terminal holding area for jobs that ran out of retries or failed fatally.
//!
//! Nothing leaves the dead-letter state on its own; `retry_dead_letter_job` is
//! the only way back to `pending`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, JobError, StoreError};
use crate::models::{Job, JobFilter, JobOrder, JobPatch, JobStatus};
use crate::queue::{DistributedCrawlQueue, dead_letter_patch};
use crate::store::chrono_ttl;

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
  pub retention: Duration,
  pub failure_window: Duration,
}

impl Default for DeadLetterConfig {
  fn default() -> Self {
    Self {
      retention: Duration::from_secs(30 * 24 * 60 * 60),
      failure_window: Duration::from_secs(60 * 60),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterStats {
  pub total: usize,
  pub by_type: BTreeMap<String, usize>,
  pub last_24h: usize,
  /// Jobs that reached `failed` or `dead_letter` within the failure window.
  pub failures_last_hour: i64,
  pub oldest: Option<DateTime<Utc>>,
}

pub struct DeadLetterQueue {
  queue: Arc<DistributedCrawlQueue>,
  config: DeadLetterConfig,
}

impl DeadLetterQueue {
  pub fn new(queue: Arc<DistributedCrawlQueue>, config: DeadLetterConfig) -> Self {
    Self { queue, config }
  }

  /// Fatal errors go straight in; anything else only once this failure
  /// spends the last attempt.
  pub fn should_move_to_dead_letter(&self, job: &Job, error: &JobError) -> bool {
    !error.is_retryable() || job.is_last_attempt()
  }

  /// Bury a job. A processing job is charged for the attempt that just failed.
  pub async fn move_to_dead_letter(&self, id: Uuid, reason: &str, kind: ErrorKind) -> Result<bool, StoreError> {
    let Some(job) = self.queue.store().get_job(id).await? else {
      return Err(StoreError::NotFound(format!("job {}", id)));
    };
    if !matches!(job.status, JobStatus::Pending | JobStatus::Processing | JobStatus::Failed) {
      return Ok(false);
    }
    let attempts = if job.status == JobStatus::Processing { job.attempts + 1 } else { job.attempts };
    let moved = self
      .queue
      .store()
      .update_conditional(id, &[job.status], dead_letter_patch(attempts, reason, kind))
      .await?;
    if moved {
      warn!(job_id = %id, attempts, kind = %kind, reason, "job moved to dead letter");
    }
    Ok(moved)
  }

  pub async fn retry_dead_letter_job(&self, id: Uuid) -> Result<bool, StoreError> {
    let patch = JobPatch::default()
      .with_status(JobStatus::Pending)
      .with_attempts(0)
      .with_scheduled_at(Utc::now())
      .with_started_at(None)
      .with_completed_at(None)
      .with_error(None, None);
    let retried = self.queue.store().update_conditional(id, &[JobStatus::DeadLetter], patch).await?;
    if retried {
      info!(job_id = %id, "dead letter job requeued");
    }
    Ok(retried)
  }

  /// Most recently buried first.
  pub async fn list(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
    let filter = JobFilter::status(JobStatus::DeadLetter).order(JobOrder::RecentlyUpdated).limit(limit);
    self.queue.store().query_jobs(&filter).await
  }

  pub async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
    let job = self.queue.store().get_job(id).await?;
    Ok(job.filter(|j| j.status == JobStatus::DeadLetter))
  }

  pub async fn cleanup_old_dead_letter_jobs(&self) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - chrono_ttl(self.config.retention);
    let removed = self
      .queue
      .store()
      .delete_jobs(&JobFilter::status(JobStatus::DeadLetter).updated_before(cutoff))
      .await?;
    if removed > 0 {
      info!(removed, "old dead letter jobs removed");
    }
    Ok(removed)
  }

  pub async fn failures_in_window(&self) -> Result<i64, StoreError> {
    let since = Utc::now() - chrono_ttl(self.config.failure_window);
    let filter = JobFilter::statuses([JobStatus::Failed, JobStatus::DeadLetter]).updated_after(since);
    self.queue.store().count_jobs(&filter).await
  }

  pub async fn statistics(&self) -> Result<DeadLetterStats, StoreError> {
    let now = Utc::now();
    let jobs = self.queue.store().query_jobs(&JobFilter::status(JobStatus::DeadLetter)).await?;
    let mut stats = DeadLetterStats { total: jobs.len(), ..Default::default() };
    for job in &jobs {
      *stats.by_type.entry(job.kind().to_string()).or_default() += 1;
      if now - job.updated_at <= chrono::Duration::hours(24) {
        stats.last_24h += 1;
      }
    }
    stats.oldest = jobs.iter().map(|j| j.updated_at).min();
    stats.failures_last_hour = self.failures_in_window().await?;
    Ok(stats)
  }
}
