//! In-process store. Exact for a single process, used by tests and local runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobStore, StoreResult, chrono_ttl};
use crate::models::{
  CrawlSession, DomainLock, Job, JobFilter, JobPatch, JobStatus, NewJob, SessionPatch, SessionStatus,
};

#[derive(Default)]
struct MemoryState {
  jobs: HashMap<Uuid, Job>,
  locks: HashMap<Uuid, DomainLock>,
  sessions: HashMap<Uuid, CrawlSession>,
}

impl MemoryState {
  fn select(&self, filter: &JobFilter) -> Vec<Job> {
    let mut jobs: Vec<Job> = self.jobs.values().filter(|job| filter.matches(job)).cloned().collect();
    jobs.sort_by(|a, b| filter.compare(a, b));
    if let Some(limit) = filter.limit {
      jobs.truncate(limit.max(0) as usize);
    }
    jobs
  }

  fn update_if(&mut self, id: Uuid, expected: &[JobStatus], attempts: Option<i32>, patch: &JobPatch) -> bool {
    match self.jobs.get_mut(&id) {
      Some(job)
        if (expected.is_empty() || expected.contains(&job.status))
          && attempts.is_none_or(|attempts| job.attempts == attempts) =>
      {
        patch.apply(job, Utc::now());
        true
      }
      _ => false,
    }
  }
}

#[derive(Default)]
pub struct MemoryJobStore {
  state: Mutex<MemoryState>,
}

impl MemoryJobStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a fully-formed row, bypassing enqueue defaults. Used for
  /// fixtures and imports that need explicit timestamps.
  pub async fn insert_raw(&self, job: Job) {
    self.state.lock().await.jobs.insert(job.id, job);
  }

  pub async fn insert_raw_lock(&self, lock: DomainLock) {
    self.state.lock().await.locks.insert(lock.id, lock);
  }
}

#[async_trait]
impl JobStore for MemoryJobStore {
  async fn insert_job(&self, job: NewJob) -> StoreResult<Uuid> {
    let id = Uuid::new_v4();
    let job = job.into_job(id, Utc::now());
    self.state.lock().await.jobs.insert(id, job);
    Ok(id)
  }

  async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
    Ok(self.state.lock().await.jobs.get(&id).cloned())
  }

  async fn claim_next_pending(&self, limit: i64, max_processing: Option<i64>) -> StoreResult<Vec<Job>> {
    let now = Utc::now();
    let mut state = self.state.lock().await;
    let mut limit = limit;
    if let Some(max) = max_processing {
      let processing = state.jobs.values().filter(|j| j.status == JobStatus::Processing).count() as i64;
      limit = limit.min(max - processing);
    }
    if limit <= 0 {
      return Ok(Vec::new());
    }
    let candidates = state.select(&JobFilter::status(JobStatus::Pending).eligible_at(now).limit(limit));
    let mut claimed = Vec::with_capacity(candidates.len());
    for candidate in candidates {
      if let Some(job) = state.jobs.get_mut(&candidate.id) {
        JobPatch::default()
          .with_status(JobStatus::Processing)
          .with_started_at(Some(now))
          .apply(job, now);
        claimed.push(job.clone());
      }
    }
    Ok(claimed)
  }

  async fn claim_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
    let now = Utc::now();
    let mut state = self.state.lock().await;
    match state.jobs.get_mut(&id) {
      Some(job) if job.status == JobStatus::Pending => {
        JobPatch::default()
          .with_status(JobStatus::Processing)
          .with_started_at(Some(now))
          .apply(job, now);
        Ok(Some(job.clone()))
      }
      _ => Ok(None),
    }
  }

  async fn update_conditional(&self, id: Uuid, expected: &[JobStatus], patch: JobPatch) -> StoreResult<bool> {
    Ok(self.state.lock().await.update_if(id, expected, None, &patch))
  }

  async fn update_conditional_attempts(
    &self,
    id: Uuid,
    expected: &[JobStatus],
    attempts: i32,
    patch: JobPatch,
  ) -> StoreResult<bool> {
    Ok(self.state.lock().await.update_if(id, expected, Some(attempts), &patch))
  }

  async fn query_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
    Ok(self.state.lock().await.select(filter))
  }

  async fn count_jobs(&self, filter: &JobFilter) -> StoreResult<i64> {
    let state = self.state.lock().await;
    Ok(state.jobs.values().filter(|job| filter.matches(job)).count() as i64)
  }

  async fn delete_jobs(&self, filter: &JobFilter) -> StoreResult<u64> {
    let mut state = self.state.lock().await;
    let doomed: Vec<Uuid> = state.select(filter).into_iter().map(|job| job.id).collect();
    for id in &doomed {
      state.jobs.remove(id);
    }
    Ok(doomed.len() as u64)
  }

  async fn try_acquire_lock(
    &self,
    domain: &str,
    worker_id: &str,
    max_concurrent: i64,
    ttl: Duration,
  ) -> StoreResult<Option<DomainLock>> {
    let now = Utc::now();
    let mut state = self.state.lock().await;
    let active = state
      .locks
      .values()
      .filter(|lock| lock.domain == domain && !lock.is_expired(now))
      .count() as i64;
    if active >= max_concurrent {
      return Ok(None);
    }
    let lock = DomainLock {
      id: Uuid::new_v4(),
      domain: domain.to_string(),
      worker_id: worker_id.to_string(),
      acquired_at: now,
      expires_at: now + chrono_ttl(ttl),
    };
    state.locks.insert(lock.id, lock.clone());
    Ok(Some(lock))
  }

  async fn release_lock(&self, lock_id: Uuid) -> StoreResult<bool> {
    Ok(self.state.lock().await.locks.remove(&lock_id).is_some())
  }

  async fn renew_lock(&self, lock_id: Uuid, ttl: Duration) -> StoreResult<bool> {
    let now = Utc::now();
    let mut state = self.state.lock().await;
    match state.locks.get_mut(&lock_id) {
      Some(lock) if !lock.is_expired(now) => {
        lock.expires_at = now + chrono_ttl(ttl);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn active_locks(&self, domain: &str) -> StoreResult<Vec<DomainLock>> {
    let now = Utc::now();
    let state = self.state.lock().await;
    let mut locks: Vec<DomainLock> = state
      .locks
      .values()
      .filter(|lock| lock.domain == domain && !lock.is_expired(now))
      .cloned()
      .collect();
    locks.sort_by_key(|lock| lock.acquired_at);
    Ok(locks)
  }

  async fn delete_expired_locks(&self) -> StoreResult<u64> {
    let now = Utc::now();
    let mut state = self.state.lock().await;
    let before = state.locks.len();
    state.locks.retain(|_, lock| !lock.is_expired(now));
    Ok((before - state.locks.len()) as u64)
  }

  async fn insert_session(&self, session: &CrawlSession) -> StoreResult<()> {
    self.state.lock().await.sessions.insert(session.id, session.clone());
    Ok(())
  }

  async fn get_session(&self, id: Uuid) -> StoreResult<Option<CrawlSession>> {
    Ok(self.state.lock().await.sessions.get(&id).cloned())
  }

  async fn update_session(&self, id: Uuid, expected: &[SessionStatus], patch: SessionPatch) -> StoreResult<bool> {
    let mut state = self.state.lock().await;
    match state.sessions.get_mut(&id) {
      Some(session) if expected.is_empty() || expected.contains(&session.status) => {
        patch.apply(session, Utc::now());
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn list_sessions(&self, statuses: &[SessionStatus]) -> StoreResult<Vec<CrawlSession>> {
    let state = self.state.lock().await;
    let mut sessions: Vec<CrawlSession> = state
      .sessions
      .values()
      .filter(|s| statuses.is_empty() || statuses.contains(&s.status))
      .cloned()
      .collect();
    sessions.sort_by_key(|s| s.created_at);
    Ok(sessions)
  }
}
