//! Poll-claim-dispatch loop for one worker process.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dead_letter::DeadLetterQueue;
use crate::error::{JobError, StoreError};
use crate::heartbeat::JobHeartbeat;
use crate::models::{Job, JobKind};
use crate::queue::DistributedCrawlQueue;
use crate::starvation::QueueStarvationProtection;
use crate::worker_processing::{JobExecutor, JobOutcome};

/// Maps each job kind to the executor that runs it.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
  executors: HashMap<JobKind, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(mut self, kind: JobKind, executor: Arc<dyn JobExecutor>) -> Self {
    self.executors.insert(kind, executor);
    self
  }

  pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobExecutor>> {
    self.executors.get(&kind).cloned()
  }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
  pub poll_interval: Duration,
  pub max_concurrent: usize,
  pub job_timeout: Duration,
  /// How long a deferred job waits before it is eligible again.
  pub defer_delay: Duration,
}

impl Default for ManagerConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(2),
      max_concurrent: 4,
      job_timeout: Duration::from_secs(5 * 60),
      defer_delay: Duration::from_secs(5),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
  pub active: usize,
  pub completed: u64,
  pub failed: u64,
  pub dead_lettered: u64,
  pub deferred: u64,
}

#[derive(Default)]
struct Counters {
  completed: AtomicU64,
  failed: AtomicU64,
  dead_lettered: AtomicU64,
  deferred: AtomicU64,
}

/// Built once per process and shared by handle; owns the dispatch loop.
pub struct ProductionQueueManager {
  queue: Arc<DistributedCrawlQueue>,
  starvation: Arc<QueueStarvationProtection>,
  heartbeat: Arc<JobHeartbeat>,
  dead_letter: Arc<DeadLetterQueue>,
  executors: ExecutorRegistry,
  config: ManagerConfig,
  permits: Arc<Semaphore>,
  counters: Counters,
  done: AtomicBool,
}

impl ProductionQueueManager {
  pub fn new(
    queue: Arc<DistributedCrawlQueue>,
    starvation: Arc<QueueStarvationProtection>,
    heartbeat: Arc<JobHeartbeat>,
    dead_letter: Arc<DeadLetterQueue>,
    executors: ExecutorRegistry,
    config: ManagerConfig,
  ) -> Self {
    let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    Self {
      queue,
      starvation,
      heartbeat,
      dead_letter,
      executors,
      config,
      permits,
      counters: Counters::default(),
      done: AtomicBool::new(false),
    }
  }

  /// Claim as many jobs as there are free slots and spawn each one. Returns
  /// without waiting for them.
  pub async fn run_cycle(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, StoreError> {
    let free = self.permits.available_permits();
    if free == 0 {
      return Ok(Vec::new());
    }
    let candidates = self.starvation.select(free).await?;
    let mut handles = Vec::with_capacity(candidates.len());
    for candidate in candidates {
      let Ok(permit) = self.permits.clone().try_acquire_owned() else {
        break;
      };
      let Some(job) = self.queue.claim_job(candidate.id).await? else {
        debug!(job_id = %candidate.id, "candidate claimed elsewhere");
        continue;
      };
      info!(job_id = %job.id, kind = %job.kind(), priority = job.priority, attempts = job.attempts, "job claimed");
      let this = self.clone();
      handles.push(tokio::spawn(async move { this.run_job(job, permit).await }));
    }
    Ok(handles)
  }

  async fn run_job(self: Arc<Self>, job: Job, _permit: OwnedSemaphorePermit) {
    self.heartbeat.register_job(job.id).await;
    let beat = self.heartbeat.spawn_beat(job.id);

    let outcome = match self.executors.get(job.kind()) {
      Some(executor) => {
        let run = AssertUnwindSafe(executor.execute(&job)).catch_unwind();
        match tokio::time::timeout(self.config.job_timeout, run).await {
          Ok(Ok(result)) => result,
          Ok(Err(_)) => Err(JobError::Transient("executor panicked".into())),
          Err(_) => Err(JobError::Timeout(self.config.job_timeout)),
        }
      }
      None => Err(JobError::UnknownJobType(job.kind().to_string())),
    };

    beat.abort();
    self.heartbeat.unregister_job(job.id).await;
    if let Err(e) = self.settle(&job, outcome).await {
      error!(job_id = %job.id, error = %e, "could not record job outcome");
    }
  }

  async fn settle(&self, job: &Job, outcome: Result<JobOutcome, JobError>) -> Result<(), StoreError> {
    match outcome {
      Ok(JobOutcome::Completed(result)) => {
        if self.queue.complete_job(job.id, result).await? {
          self.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
      }
      Ok(JobOutcome::Deferred(reason)) => {
        if self.queue.defer_job(job.id, self.config.defer_delay).await? {
          self.counters.deferred.fetch_add(1, Ordering::Relaxed);
          debug!(job_id = %job.id, reason = %reason, "job deferred");
        }
      }
      Err(err) => {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let message = err.to_string();
        if self.dead_letter.should_move_to_dead_letter(job, &err) {
          if self.dead_letter.move_to_dead_letter(job.id, &message, err.kind()).await? {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
          }
        } else {
          self.queue.fail_job_with_kind(job.id, &message, err.kind()).await?;
        }
      }
    }
    Ok(())
  }

  pub fn stats(&self) -> ManagerStats {
    ManagerStats {
      active: self.config.max_concurrent.max(1) - self.permits.available_permits(),
      completed: self.counters.completed.load(Ordering::Relaxed),
      failed: self.counters.failed.load(Ordering::Relaxed),
      dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
      deferred: self.counters.deferred.load(Ordering::Relaxed),
    }
  }

  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      info!(max_concurrent = self.config.max_concurrent, poll = ?self.config.poll_interval, "queue manager started");
      while !self.done.load(Ordering::Relaxed) {
        if let Err(e) = self.run_cycle().await {
          error!(error = %e, "dispatch cycle failed");
        }
        tokio::time::sleep(self.config.poll_interval).await;
      }
      debug!("queue manager loop stopped");
    })
  }

  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }

  /// Wait for in-flight jobs to settle.
  pub async fn drain(&self) {
    let slots = self.config.max_concurrent.max(1) as u32;
    match self.permits.acquire_many(slots).await {
      Ok(permits) => drop(permits),
      Err(e) => warn!(error = %e, "job slots closed while draining"),
    }
  }

  /// Run the loop until Ctrl+C, then stop claiming and drain.
  pub async fn run_until_shutdown(self: Arc<Self>) {
    let handle = self.clone().start();
    if let Err(e) = tokio::signal::ctrl_c().await {
      error!(error = %e, "could not listen for shutdown signal");
    }
    info!("shutdown requested, draining in-flight jobs");
    self.shutdown();
    if let Err(e) = handle.await {
      error!(error = %e, "queue manager loop ended abnormally");
    }
    self.drain().await;
    info!(stats = ?self.stats(), "queue manager stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dead_letter::DeadLetterConfig;
  use crate::error::ErrorKind;
  use crate::heartbeat::HeartbeatConfig;
  use crate::models::{JobPayload, JobPriority, JobStatus};
  use crate::queue::QueueConfig;
  use crate::starvation::StarvationConfig;
  use crate::store::{JobStore, MemoryJobStore};
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;
  use uuid::Uuid;

  type Script = Box<dyn Fn(usize) -> Result<JobOutcome, JobError> + Send + Sync>;

  /// Answers each call with `script(call_number)` after an optional delay.
  struct ScriptedExecutor {
    calls: AtomicUsize,
    delay: Duration,
    script: Script,
  }

  impl ScriptedExecutor {
    fn new(script: impl Fn(usize) -> Result<JobOutcome, JobError> + Send + Sync + 'static) -> Self {
      Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, script: Box::new(script) }
    }

    fn slow(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }
  }

  #[async_trait]
  impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, _job: &Job) -> Result<JobOutcome, JobError> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      (self.script)(call)
    }
  }

  fn manager(executor: Option<ScriptedExecutor>, config: ManagerConfig) -> (Arc<MemoryJobStore>, Arc<ProductionQueueManager>) {
    let store = Arc::new(MemoryJobStore::new());
    let queue_config = QueueConfig { backoff_base: Duration::from_millis(1), ..Default::default() };
    let queue = Arc::new(DistributedCrawlQueue::new(store.clone(), queue_config));
    let starvation = Arc::new(QueueStarvationProtection::new(queue.clone(), StarvationConfig::default()));
    let heartbeat = Arc::new(JobHeartbeat::new(queue.clone(), HeartbeatConfig::default()));
    let dead_letter = Arc::new(DeadLetterQueue::new(queue.clone(), DeadLetterConfig::default()));
    let mut executors = ExecutorRegistry::new();
    if let Some(executor) = executor {
      executors = executors.register(JobKind::Generic, Arc::new(executor));
    }
    let manager = ProductionQueueManager::new(queue, starvation, heartbeat, dead_letter, executors, config);
    (store, Arc::new(manager))
  }

  async fn enqueue(manager: &ProductionQueueManager) -> Uuid {
    let payload = JobPayload::Generic { name: "unit".into(), data: serde_json::Value::Null };
    manager.queue.enqueue(payload, JobPriority::Normal).await.unwrap()
  }

  async fn cycle(manager: &Arc<ProductionQueueManager>) -> usize {
    let handles = manager.run_cycle().await.unwrap();
    let n = handles.len();
    for handle in handles {
      handle.await.unwrap();
    }
    n
  }

  #[tokio::test]
  async fn successful_job_is_completed_and_untracked() {
    let executor = ScriptedExecutor::new(|_| Ok(JobOutcome::Completed(serde_json::json!({"ok": true}))));
    let (store, manager) = manager(Some(executor), ManagerConfig::default());
    let id = enqueue(&manager).await;

    assert_eq!(cycle(&manager).await, 1);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(serde_json::json!({"ok": true})));
    assert!(manager.heartbeat.tracked_jobs().await.is_empty());
    assert_eq!(manager.stats().completed, 1);
    assert_eq!(manager.stats().active, 0);
  }

  #[tokio::test]
  async fn always_failing_job_is_dead_lettered_after_three_attempts() {
    let executor = ScriptedExecutor::new(|_| Err(JobError::Transient("upstream 503".into())));
    let (store, manager) = manager(Some(executor), ManagerConfig::default());
    let id = enqueue(&manager).await;

    let mut runs = 0;
    for _ in 0..10 {
      runs += cycle(&manager).await;
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(runs, 3);
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 3);
    assert_eq!(manager.stats().dead_lettered, 1);
  }

  #[tokio::test]
  async fn unknown_kind_goes_straight_to_dead_letter() {
    let (store, manager) = manager(None, ManagerConfig::default());
    let id = enqueue(&manager).await;
    cycle(&manager).await;
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_kind, Some(ErrorKind::NonRetryable));
  }

  #[tokio::test]
  async fn deferred_job_keeps_its_attempts() {
    let executor = ScriptedExecutor::new(|_| Ok(JobOutcome::Deferred("domain busy".into())));
    let config = ManagerConfig { defer_delay: Duration::from_secs(60), ..Default::default() };
    let (store, manager) = manager(Some(executor), config);
    let id = enqueue(&manager).await;

    assert_eq!(cycle(&manager).await, 1);
    assert_eq!(cycle(&manager).await, 0);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(manager.stats().deferred, 1);
  }

  #[tokio::test]
  async fn timed_out_job_is_retried_with_timeout_kind() {
    let executor = ScriptedExecutor::new(|_| Ok(JobOutcome::Completed(serde_json::Value::Null)))
      .slow(Duration::from_millis(200));
    let config = ManagerConfig { job_timeout: Duration::from_millis(20), ..Default::default() };
    let (store, manager) = manager(Some(executor), config);
    let id = enqueue(&manager).await;

    cycle(&manager).await;
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_kind, Some(ErrorKind::Timeout));
  }

  #[tokio::test]
  async fn dispatch_never_exceeds_free_slots() {
    let executor = ScriptedExecutor::new(|_| Ok(JobOutcome::Completed(serde_json::Value::Null)))
      .slow(Duration::from_millis(50));
    let config = ManagerConfig { max_concurrent: 2, ..Default::default() };
    let (store, manager) = manager(Some(executor), config);
    for _ in 0..5 {
      enqueue(&manager).await;
    }

    let first = manager.run_cycle().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(manager.stats().active, 2);
    assert!(manager.run_cycle().await.unwrap().is_empty());
    for handle in first {
      handle.await.unwrap();
    }
    assert_eq!(store.count_jobs(&crate::models::JobFilter::status(JobStatus::Pending)).await.unwrap(), 3);
  }

  #[tokio::test]
  async fn loop_stops_on_shutdown() {
    let executor = ScriptedExecutor::new(|_| Ok(JobOutcome::Completed(serde_json::Value::Null)));
    let config = ManagerConfig { poll_interval: Duration::from_millis(5), ..Default::default() };
    let (store, manager) = manager(Some(executor), config);
    let id = enqueue(&manager).await;

    let handle = manager.clone().start();
    tokio::time::timeout(Duration::from_secs(2), async {
      while store.get_job(id).await.unwrap().unwrap().status != JobStatus::Completed {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    manager.shutdown();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    manager.drain().await;
  }
}
