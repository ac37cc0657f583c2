//! Liveness tracking for jobs this process is executing.
//!
//! The entry map is memory-only. It catches a wedged job well before the hard
//! timeout, while `recover_orphans` covers jobs whose owning process is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{JobFilter, JobOrder, JobStatus};
use crate::queue::{DistributedCrawlQueue, StallAction};
use crate::store::chrono_ttl;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
  pub beat_interval: Duration,
  pub check_interval: Duration,
  pub max_missed_beats: u32,
  /// Age after which an untracked processing job counts as orphaned.
  pub processing_timeout: Duration,
}

impl Default for HeartbeatConfig {
  fn default() -> Self {
    Self {
      beat_interval: Duration::from_secs(15),
      check_interval: Duration::from_secs(30),
      max_missed_beats: 3,
      processing_timeout: Duration::from_secs(5 * 60),
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct HeartbeatEntry {
  last_heartbeat: Instant,
  missed_beats: u32,
}

pub struct JobHeartbeat {
  queue: Arc<DistributedCrawlQueue>,
  config: HeartbeatConfig,
  entries: Mutex<HashMap<Uuid, HeartbeatEntry>>,
  done: AtomicBool,
}

impl JobHeartbeat {
  pub fn new(queue: Arc<DistributedCrawlQueue>, config: HeartbeatConfig) -> Self {
    Self {
      queue,
      config,
      entries: Mutex::new(HashMap::new()),
      done: AtomicBool::new(false),
    }
  }

  pub fn config(&self) -> &HeartbeatConfig {
    &self.config
  }

  pub async fn register_job(&self, job_id: Uuid) {
    let entry = HeartbeatEntry { last_heartbeat: Instant::now(), missed_beats: 0 };
    self.entries.lock().await.insert(job_id, entry);
    debug!(job_id = %job_id, "heartbeat registered");
  }

  /// Returns false once the job is no longer tracked, which ends its beat task.
  pub async fn send_heartbeat(&self, job_id: Uuid) -> bool {
    match self.entries.lock().await.get_mut(&job_id) {
      Some(entry) => {
        entry.last_heartbeat = Instant::now();
        entry.missed_beats = 0;
        true
      }
      None => false,
    }
  }

  pub async fn unregister_job(&self, job_id: Uuid) {
    if self.entries.lock().await.remove(&job_id).is_some() {
      debug!(job_id = %job_id, "heartbeat unregistered");
    }
  }

  pub async fn is_tracked(&self, job_id: Uuid) -> bool {
    self.entries.lock().await.contains_key(&job_id)
  }

  pub async fn tracked_jobs(&self) -> Vec<Uuid> {
    self.entries.lock().await.keys().copied().collect()
  }

  /// Count a missed beat for every entry that has gone quiet and recover the
  /// ones that crossed the limit.
  pub async fn check_missed_heartbeats(&self) -> Result<Vec<(Uuid, StallAction)>, StoreError> {
    let stuck: Vec<Uuid> = {
      let mut entries = self.entries.lock().await;
      let mut stuck = Vec::new();
      for (id, entry) in entries.iter_mut() {
        if entry.last_heartbeat.elapsed() > self.config.beat_interval {
          entry.missed_beats += 1;
          debug!(job_id = %id, missed = entry.missed_beats, "heartbeat missed");
        }
        if entry.missed_beats >= self.config.max_missed_beats {
          stuck.push(*id);
        }
      }
      for id in &stuck {
        entries.remove(id);
      }
      stuck
    };

    let mut recovered = Vec::with_capacity(stuck.len());
    for id in stuck {
      let Some(job) = self.queue.store().get_job(id).await? else {
        continue;
      };
      if job.status != JobStatus::Processing {
        continue;
      }
      warn!(job_id = %id, "job missed {} heartbeats", self.config.max_missed_beats);
      let action = self.queue.recover_stalled(&job, "missed heartbeats").await?;
      recovered.push((id, action));
    }
    Ok(recovered)
  }

  /// Processing jobs past the timeout that no local entry accounts for.
  pub async fn recover_orphans(&self) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - chrono_ttl(self.config.processing_timeout);
    let filter = JobFilter::status(JobStatus::Processing)
      .started_before(cutoff)
      .order(JobOrder::OldestFirst);
    let candidates = self.queue.store().query_jobs(&filter).await?;

    let mut recovered = 0;
    for job in candidates {
      if self.is_tracked(job.id).await {
        continue;
      }
      match self.queue.recover_stalled(&job, "orphaned: no heartbeat").await? {
        StallAction::Skipped => {}
        _ => recovered += 1,
      }
    }
    if recovered > 0 {
      info!(recovered, "orphaned jobs recovered");
    }
    Ok(recovered)
  }

  /// Beat for `job_id` every interval until it is unregistered.
  pub fn spawn_beat(self: &Arc<Self>, job_id: Uuid) -> JoinHandle<()> {
    let this = self.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(this.config.beat_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      interval.tick().await;
      loop {
        interval.tick().await;
        if !this.send_heartbeat(job_id).await {
          break;
        }
      }
    })
  }

  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      info!(interval = ?self.config.check_interval, "heartbeat monitor started");
      let mut interval = tokio::time::interval(self.config.check_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if self.done.load(Ordering::Relaxed) {
          debug!("heartbeat monitor shutting down");
          break;
        }
        if let Err(e) = self.check_missed_heartbeats().await {
          error!(error = %e, "heartbeat check failed");
        }
        if let Err(e) = self.recover_orphans().await {
          error!(error = %e, "orphan scan failed");
        }
      }
    })
  }

  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }

  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}
