use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Job, JobFilter, JobPatch, JobPriority, JobStatus, PriorityBand};
use crate::queue::DistributedCrawlQueue;
use crate::store::chrono_ttl;

/// How a worker picks its next batch of candidates. One policy per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
  /// Priority-then-age after aging starved jobs upward.
  #[default]
  Priority,
  /// Fixed share per band, leftover slots filled by priority.
  Fair,
}

impl FromStr for SchedulingPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "priority" => Ok(SchedulingPolicy::Priority),
      "fair" => Ok(SchedulingPolicy::Fair),
      other => Err(format!("unknown scheduling policy: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FairShares {
  pub high: f64,
  pub normal: f64,
}

impl Default for FairShares {
  fn default() -> Self {
    Self { high: 0.4, normal: 0.4 }
  }
}

impl FairShares {
  /// Per-band slot counts for `n`; low gets whatever high and normal leave.
  pub fn quotas(&self, n: usize) -> [(PriorityBand, usize); 3] {
    let high = ((n as f64) * self.high).ceil() as usize;
    let high = high.min(n);
    let normal = (((n as f64) * self.normal).ceil() as usize).min(n - high);
    [
      (PriorityBand::High, high),
      (PriorityBand::Normal, normal),
      (PriorityBand::Low, n - high - normal),
    ]
  }
}

#[derive(Debug, Clone)]
pub struct StarvationConfig {
  pub threshold: Duration,
  pub boost_factor: f64,
  pub policy: SchedulingPolicy,
  pub shares: FairShares,
}

impl Default for StarvationConfig {
  fn default() -> Self {
    Self {
      threshold: Duration::from_secs(10 * 60),
      boost_factor: 0.5,
      policy: SchedulingPolicy::Priority,
      shares: FairShares::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandStats {
  pub band: PriorityBand,
  pub count: usize,
  pub oldest_job: Option<DateTime<Utc>>,
  pub average_wait_secs: f64,
}

pub struct QueueStarvationProtection {
  queue: Arc<DistributedCrawlQueue>,
  config: StarvationConfig,
}

impl QueueStarvationProtection {
  pub fn new(queue: Arc<DistributedCrawlQueue>, config: StarvationConfig) -> Self {
    Self { queue, config }
  }

  pub fn policy(&self) -> SchedulingPolicy {
    self.config.policy
  }

  pub async fn band_statistics(&self) -> Result<Vec<BandStats>, StoreError> {
    let now = Utc::now();
    let mut stats = Vec::with_capacity(PriorityBand::ALL.len());
    for band in PriorityBand::ALL {
      let jobs = self.queue.store().query_jobs(&JobFilter::status(JobStatus::Pending).band(band)).await?;
      let oldest_job = jobs.iter().map(|j| j.created_at).min();
      let average_wait_secs = if jobs.is_empty() {
        0.0
      } else {
        let total: i64 = jobs.iter().map(|j| j.wait_time(now).num_milliseconds()).sum();
        total as f64 / jobs.len() as f64 / 1000.0
      };
      stats.push(BandStats { band, count: jobs.len(), oldest_job, average_wait_secs });
    }
    Ok(stats)
  }

  /// The boosted value for a starved job, never better than `High`.
  pub fn boosted_priority(&self, priority: i32) -> i32 {
    let boosted = (f64::from(priority) * self.config.boost_factor).floor() as i32;
    boosted.max(JobPriority::High.value())
  }

  /// Lower the priority value of pending jobs that have waited past the
  /// threshold. Fresh jobs in the same band keep their place, and a boosted
  /// job must wait another full threshold before it is boosted again.
  pub async fn boost_starved_jobs(&self) -> Result<u64, StoreError> {
    let now = Utc::now();
    let cutoff = now - chrono_ttl(self.config.threshold);
    let filter = JobFilter::status(JobStatus::Pending)
      .priority_above(JobPriority::High.value())
      .created_before(cutoff)
      .unboosted_since(cutoff);
    let starved = self.queue.store().query_jobs(&filter).await?;

    let mut boosted = 0;
    for job in starved {
      let priority = self.boosted_priority(job.priority);
      if priority >= job.priority {
        continue;
      }
      let patch = JobPatch::default().with_priority(priority).with_boosted_at(now);
      if self.queue.store().update_conditional(job.id, &[JobStatus::Pending], patch).await? {
        debug!(job_id = %job.id, from = job.priority, to = priority, "starved job boosted");
        boosted += 1;
      }
    }
    if boosted > 0 {
      info!(boosted, "starved jobs boosted");
    }
    Ok(boosted)
  }

  /// Boost, then the `n` most urgent eligible pending jobs. Candidates are
  /// not claimed; the caller claims each one.
  pub async fn get_next_job_batch(&self, n: usize) -> Result<Vec<Job>, StoreError> {
    if n == 0 {
      return Ok(Vec::new());
    }
    self.boost_starved_jobs().await?;
    let filter = JobFilter::status(JobStatus::Pending).eligible_at(Utc::now()).limit(n as i64);
    self.queue.store().query_jobs(&filter).await
  }

  pub async fn get_fair_scheduled_jobs(&self, n: usize) -> Result<Vec<Job>, StoreError> {
    if n == 0 {
      return Ok(Vec::new());
    }
    let now = Utc::now();
    let mut selected: Vec<Job> = Vec::with_capacity(n);
    let mut seen: HashSet<Uuid> = HashSet::new();
    for (band, quota) in self.config.shares.quotas(n) {
      if quota == 0 {
        continue;
      }
      let filter = JobFilter::status(JobStatus::Pending).band(band).eligible_at(now).limit(quota as i64);
      for job in self.queue.store().query_jobs(&filter).await? {
        seen.insert(job.id);
        selected.push(job);
      }
    }

    if selected.len() < n {
      let filter = JobFilter::status(JobStatus::Pending).eligible_at(now).limit((n + selected.len()) as i64);
      for job in self.queue.store().query_jobs(&filter).await? {
        if selected.len() >= n {
          break;
        }
        if seen.insert(job.id) {
          selected.push(job);
        }
      }
    }
    Ok(selected)
  }

  pub async fn select(&self, n: usize) -> Result<Vec<Job>, StoreError> {
    match self.config.policy {
      SchedulingPolicy::Priority => self.get_next_job_batch(n).await,
      SchedulingPolicy::Fair => self.get_fair_scheduled_jobs(n).await,
    }
  }
}
