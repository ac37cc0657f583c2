//! Durable job storage contract.
//!
//! The store is the only synchronization point between workers: every
//! exclusive transition is a conditional update on the current status, and
//! domain leases are rows with an expiry. Nothing here relies on in-process
//! locks for cross-worker correctness.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
  CrawlSession, DomainLock, Job, JobFilter, JobPatch, JobStatus, NewJob, SessionPatch, SessionStatus,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync {
  /// Insert a new `pending` row and return its id.
  async fn insert_job(&self, job: NewJob) -> StoreResult<Uuid>;

  async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>>;

  /// Atomically move up to `limit` eligible pending jobs to `processing`,
  /// most urgent first. When `max_processing` is set, no job is claimed once
  /// that many jobs are already processing.
  async fn claim_next_pending(&self, limit: i64, max_processing: Option<i64>) -> StoreResult<Vec<Job>>;

  /// Move one specific job from `pending` to `processing`. Returns `None` if
  /// another caller got there first.
  async fn claim_job(&self, id: Uuid) -> StoreResult<Option<Job>>;

  /// Apply `patch` only if the row's status is one of `expected`.
  async fn update_conditional(&self, id: Uuid, expected: &[JobStatus], patch: JobPatch) -> StoreResult<bool>;

  /// As [`JobStore::update_conditional`], but the row's `attempts` must also
  /// still equal `attempts`. Guards writes computed from an earlier read.
  async fn update_conditional_attempts(
    &self,
    id: Uuid,
    expected: &[JobStatus],
    attempts: i32,
    patch: JobPatch,
  ) -> StoreResult<bool>;

  async fn query_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

  async fn count_jobs(&self, filter: &JobFilter) -> StoreResult<i64>;

  async fn delete_jobs(&self, filter: &JobFilter) -> StoreResult<u64>;

  /// Insert a lease for `domain` unless `max_concurrent` unexpired leases
  /// already exist. The count and the insert are atomic.
  async fn try_acquire_lock(
    &self,
    domain: &str,
    worker_id: &str,
    max_concurrent: i64,
    ttl: Duration,
  ) -> StoreResult<Option<DomainLock>>;

  async fn release_lock(&self, lock_id: Uuid) -> StoreResult<bool>;

  /// Push an unexpired lease's expiry to `now + ttl`. Returns `false` once the
  /// lease has expired or been removed; it is then no longer held.
  async fn renew_lock(&self, lock_id: Uuid, ttl: Duration) -> StoreResult<bool>;

  async fn active_locks(&self, domain: &str) -> StoreResult<Vec<DomainLock>>;

  async fn delete_expired_locks(&self) -> StoreResult<u64>;

  async fn insert_session(&self, session: &CrawlSession) -> StoreResult<()>;

  async fn get_session(&self, id: Uuid) -> StoreResult<Option<CrawlSession>>;

  async fn update_session(&self, id: Uuid, expected: &[SessionStatus], patch: SessionPatch) -> StoreResult<bool>;

  async fn list_sessions(&self, statuses: &[SessionStatus]) -> StoreResult<Vec<CrawlSession>>;
}

pub(crate) fn chrono_ttl(ttl: Duration) -> chrono::Duration {
  chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}
