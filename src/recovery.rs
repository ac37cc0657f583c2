use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dead_letter::DeadLetterQueue;
use crate::error::StoreError;
use crate::heartbeat::JobHeartbeat;
use crate::models::{JobFilter, JobOrder, JobPatch, JobStatus};
use crate::queue::{DistributedCrawlQueue, StallAction};
use crate::rate_limiter::DomainRateLimiter;
use crate::store::chrono_ttl;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
  pub interval: Duration,
  pub stale_threshold: Duration,
  /// Failures per dead-letter failure window above which the queue is flagged.
  pub failure_rate_threshold: i64,
}

impl Default for RecoveryConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(60),
      stale_threshold: Duration::from_secs(5 * 60),
      failure_rate_threshold: 5,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
  pub expired_locks: u64,
  pub stuck_requeued: u64,
  pub stuck_dead_lettered: u64,
  pub orphans_recovered: u64,
  pub failed_promoted: u64,
  pub failures_last_hour: i64,
  pub unhealthy: bool,
  pub dead_letters_removed: u64,
}

/// Periodic self-healing pass. Every write it makes is conditional on the
/// row's current status, so it can run beside live workers.
pub struct AutomaticQueueRecovery {
  queue: Arc<DistributedCrawlQueue>,
  limiter: Arc<DomainRateLimiter>,
  heartbeat: Arc<JobHeartbeat>,
  dead_letter: Arc<DeadLetterQueue>,
  config: RecoveryConfig,
  done: AtomicBool,
}

impl AutomaticQueueRecovery {
  pub fn new(
    queue: Arc<DistributedCrawlQueue>,
    limiter: Arc<DomainRateLimiter>,
    heartbeat: Arc<JobHeartbeat>,
    dead_letter: Arc<DeadLetterQueue>,
    config: RecoveryConfig,
  ) -> Self {
    Self { queue, limiter, heartbeat, dead_letter, config, done: AtomicBool::new(false) }
  }

  /// One full pass. A failing step is logged and the remaining steps still run.
  pub async fn run_once(&self) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    match self.limiter.cleanup_expired_locks().await {
      Ok(n) => report.expired_locks = n,
      Err(e) => error!(error = %e, "expired lock cleanup failed"),
    }
    if let Err(e) = self.recover_stuck_jobs(&mut report).await {
      error!(error = %e, "stuck job recovery failed");
    }
    match self.heartbeat.recover_orphans().await {
      Ok(n) => report.orphans_recovered = n,
      Err(e) => error!(error = %e, "orphan recovery failed"),
    }
    match self.promote_retryable_failures().await {
      Ok(n) => report.failed_promoted = n,
      Err(e) => error!(error = %e, "failed job promotion failed"),
    }
    match self.dead_letter.failures_in_window().await {
      Ok(failures) => {
        report.failures_last_hour = failures;
        if failures > self.config.failure_rate_threshold {
          report.unhealthy = true;
          warn!(
            failures,
            threshold = self.config.failure_rate_threshold,
            "queue failure rate above threshold"
          );
        }
      }
      Err(e) => error!(error = %e, "failure rate sampling failed"),
    }
    match self.dead_letter.cleanup_old_dead_letter_jobs().await {
      Ok(n) => report.dead_letters_removed = n,
      Err(e) => error!(error = %e, "dead letter cleanup failed"),
    }

    debug!(report = ?report, "recovery pass finished");
    report
  }

  async fn recover_stuck_jobs(&self, report: &mut RecoveryReport) -> Result<(), StoreError> {
    let cutoff = Utc::now() - chrono_ttl(self.config.stale_threshold);
    let filter = JobFilter::status(JobStatus::Processing)
      .started_before(cutoff)
      .order(JobOrder::OldestFirst);
    for job in self.queue.store().query_jobs(&filter).await? {
      self.heartbeat.unregister_job(job.id).await;
      match self.queue.recover_stalled(&job, "stuck in processing").await? {
        StallAction::Requeued => report.stuck_requeued += 1,
        StallAction::DeadLettered => report.stuck_dead_lettered += 1,
        StallAction::Skipped => {}
      }
    }
    Ok(())
  }

  /// `failed` rows with a retryable kind and budget left go back to `pending`
  /// once their backoff has elapsed since the failure.
  async fn promote_retryable_failures(&self) -> Result<u64, StoreError> {
    let now = Utc::now();
    let failed = self.queue.store().query_jobs(&JobFilter::status(JobStatus::Failed)).await?;
    let mut promoted = 0;
    for job in failed {
      let retryable = job.error_kind.is_some_and(|kind| kind.should_retry());
      if !retryable || job.attempts >= job.max_attempts {
        continue;
      }
      if job.updated_at + chrono_ttl(self.queue.backoff(job.attempts)) > now {
        continue;
      }
      let patch = JobPatch::default()
        .with_status(JobStatus::Pending)
        .with_scheduled_at(now)
        .with_started_at(None)
        .with_completed_at(None);
      if self.queue.store().update_conditional(job.id, &[JobStatus::Failed], patch).await? {
        info!(job_id = %job.id, attempts = job.attempts, "failed job promoted for retry");
        promoted += 1;
      }
    }
    Ok(promoted)
  }

  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      info!(interval = ?self.config.interval, "queue recovery started");
      let mut interval = tokio::time::interval(self.config.interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if self.done.load(Ordering::Relaxed) {
          debug!("queue recovery shutting down");
          break;
        }
        self.run_once().await;
      }
    })
  }

  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dead_letter::DeadLetterConfig;
  use crate::error::ErrorKind;
  use crate::heartbeat::HeartbeatConfig;
  use crate::models::{DomainLock, Job, JobPayload, NewJob};
  use crate::queue::QueueConfig;
  use crate::rate_limiter::RateLimitConfig;
  use crate::store::{JobStore, MemoryJobStore};
  use uuid::Uuid;

  struct Fixture {
    store: Arc<MemoryJobStore>,
    heartbeat: Arc<JobHeartbeat>,
    recovery: AutomaticQueueRecovery,
  }

  fn fixture() -> Fixture {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(DistributedCrawlQueue::new(store.clone(), QueueConfig::default()));
    let limiter = Arc::new(DomainRateLimiter::new(store.clone(), RateLimitConfig::default(), "recovery-test"));
    let heartbeat = Arc::new(JobHeartbeat::new(queue.clone(), HeartbeatConfig::default()));
    let dead_letter = Arc::new(DeadLetterQueue::new(queue.clone(), DeadLetterConfig::default()));
    let recovery =
      AutomaticQueueRecovery::new(queue, limiter, heartbeat.clone(), dead_letter, RecoveryConfig::default());
    Fixture { store, heartbeat, recovery }
  }

  fn job_aged(minutes: i64) -> Job {
    let payload = JobPayload::Generic { name: "fixture".into(), data: serde_json::Value::Null };
    NewJob::new(payload).into_job(Uuid::new_v4(), Utc::now() - chrono::Duration::minutes(minutes))
  }

  fn stuck(attempts: i32) -> Job {
    let mut job = job_aged(60);
    job.status = JobStatus::Processing;
    job.attempts = attempts;
    job.started_at = Some(Utc::now() - chrono::Duration::minutes(30));
    job
  }

  #[tokio::test]
  async fn stuck_jobs_never_stay_processing() {
    let f = fixture();
    let retry = stuck(0);
    let exhausted = stuck(2);
    f.store.insert_raw(retry.clone()).await;
    f.store.insert_raw(exhausted.clone()).await;
    f.heartbeat.register_job(retry.id).await;

    let report = f.recovery.run_once().await;
    assert_eq!(report.stuck_requeued, 1);
    assert_eq!(report.stuck_dead_lettered, 1);
    assert_eq!(report.orphans_recovered, 0);
    assert!(!f.heartbeat.is_tracked(retry.id).await);

    let retry = f.store.get_job(retry.id).await.unwrap().unwrap();
    assert_eq!(retry.status, JobStatus::Pending);
    assert_eq!(retry.attempts, 1);
    let exhausted = f.store.get_job(exhausted.id).await.unwrap().unwrap();
    assert_eq!(exhausted.status, JobStatus::DeadLetter);
    assert_eq!(exhausted.error_kind, Some(ErrorKind::Stalled));

    let again = f.recovery.run_once().await;
    assert_eq!(again.stuck_requeued + again.stuck_dead_lettered, 0);
  }

  #[tokio::test]
  async fn retryable_failures_are_promoted_after_backoff() {
    let f = fixture();
    let mut due = job_aged(10);
    due.status = JobStatus::Failed;
    due.attempts = 1;
    due.error_kind = Some(ErrorKind::Retryable);

    let mut fatal = due.clone();
    fatal.id = Uuid::new_v4();
    fatal.error_kind = Some(ErrorKind::NonRetryable);

    let mut exhausted = due.clone();
    exhausted.id = Uuid::new_v4();
    exhausted.attempts = 3;

    let mut waiting = due.clone();
    waiting.id = Uuid::new_v4();
    waiting.updated_at = Utc::now();

    for job in [&due, &fatal, &exhausted, &waiting] {
      f.store.insert_raw(job.clone()).await;
    }

    assert_eq!(f.recovery.run_once().await.failed_promoted, 1);
    assert_eq!(f.store.get_job(due.id).await.unwrap().unwrap().status, JobStatus::Pending);
    for id in [fatal.id, exhausted.id, waiting.id] {
      assert_eq!(f.store.get_job(id).await.unwrap().unwrap().status, JobStatus::Failed);
    }
  }

  #[tokio::test]
  async fn failure_burst_flags_queue_unhealthy() {
    let f = fixture();
    for _ in 0..6 {
      let mut job = job_aged(1);
      job.status = JobStatus::Failed;
      job.error_kind = Some(ErrorKind::NonRetryable);
      f.store.insert_raw(job).await;
    }
    let report = f.recovery.run_once().await;
    assert_eq!(report.failures_last_hour, 6);
    assert!(report.unhealthy);
  }

  #[tokio::test]
  async fn quiet_queue_is_healthy_and_locks_are_swept() {
    let f = fixture();
    let now = Utc::now();
    f.store
      .insert_raw_lock(DomainLock {
        id: Uuid::new_v4(),
        domain: "example.com".into(),
        worker_id: "dead-worker".into(),
        acquired_at: now - chrono::Duration::minutes(2),
        expires_at: now - chrono::Duration::minutes(1),
      })
      .await;
    let report = f.recovery.run_once().await;
    assert_eq!(report.expired_locks, 1);
    assert!(!report.unhealthy);
  }
}
