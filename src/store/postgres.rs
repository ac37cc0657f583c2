//! Postgres-backed store. Exclusive transitions are single conditional
//! statements, claiming uses `FOR UPDATE SKIP LOCKED`, and lease acquisition is
//! serialized per domain with a transaction-scoped advisory lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{JobStore, StoreResult};
use crate::error::StoreError;
use crate::models::{
  CrawlSession, DomainLock, Job, JobFilter, JobOrder, JobPatch, JobStatus, NewJob, SessionPatch, SessionStatus,
};

const JOB_COLUMNS: &str = "id, job_type, payload, status, priority, attempts, max_attempts, scheduled_at, \
  started_at, completed_at, error_message, error_kind, result, boosted_at, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, parent_source_id, start_url, status, total_pages, processed_pages, \
  failed_pages, total_batches, completed_batches, failed_batches, metadata, error_message, created_at, \
  updated_at, completed_at";

/// Advisory key serializing capped claims. Above the int4 range so it never
/// meets a `hashtext(domain)` key.
const CLAIM_LOCK_KEY: i64 = 0x6372_6177_6c71;

#[derive(FromRow)]
struct JobRow {
  id: Uuid,
  job_type: String,
  payload: serde_json::Value,
  status: String,
  priority: i32,
  attempts: i32,
  max_attempts: i32,
  scheduled_at: DateTime<Utc>,
  started_at: Option<DateTime<Utc>>,
  completed_at: Option<DateTime<Utc>>,
  error_message: Option<String>,
  error_kind: Option<String>,
  result: Option<serde_json::Value>,
  boosted_at: Option<DateTime<Utc>>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
  type Error = StoreError;

  fn try_from(row: JobRow) -> Result<Self, Self::Error> {
    let payload: crate::models::JobPayload = serde_json::from_value(row.payload)?;
    if payload.kind().as_str() != row.job_type {
      return Err(StoreError::InvalidValue { field: "job_type", value: row.job_type });
    }
    Ok(Job {
      id: row.id,
      payload,
      status: row.status.parse()?,
      priority: row.priority,
      attempts: row.attempts,
      max_attempts: row.max_attempts,
      scheduled_at: row.scheduled_at,
      started_at: row.started_at,
      completed_at: row.completed_at,
      error_message: row.error_message,
      error_kind: row.error_kind.as_deref().map(str::parse).transpose()?,
      result: row.result,
      boosted_at: row.boosted_at,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(FromRow)]
struct SessionRow {
  id: Uuid,
  parent_source_id: Uuid,
  start_url: String,
  status: String,
  total_pages: i32,
  processed_pages: i32,
  failed_pages: i32,
  total_batches: i32,
  completed_batches: i32,
  failed_batches: i32,
  metadata: serde_json::Value,
  error_message: Option<String>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
  completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionRow> for CrawlSession {
  type Error = StoreError;

  fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
    Ok(CrawlSession {
      id: row.id,
      parent_source_id: row.parent_source_id,
      start_url: row.start_url,
      status: row.status.parse()?,
      total_pages: row.total_pages,
      processed_pages: row.processed_pages,
      failed_pages: row.failed_pages,
      total_batches: row.total_batches,
      completed_batches: row.completed_batches,
      failed_batches: row.failed_batches,
      metadata: row.metadata,
      error_message: row.error_message,
      created_at: row.created_at,
      updated_at: row.updated_at,
      completed_at: row.completed_at,
    })
  }
}

fn into_jobs(rows: Vec<JobRow>) -> StoreResult<Vec<Job>> {
  rows.into_iter().map(Job::try_from).collect()
}

fn status_texts(statuses: &[JobStatus]) -> Vec<String> {
  statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
  qb.push(" WHERE TRUE");
  if !filter.statuses.is_empty() {
    qb.push(" AND status = ANY(").push_bind(status_texts(&filter.statuses)).push(")");
  }
  if let Some(kind) = filter.kind {
    qb.push(" AND job_type = ").push_bind(kind.as_str());
  }
  if let Some(session_id) = filter.session_id {
    qb.push(" AND payload->>'session_id' = ").push_bind(session_id.to_string());
  }
  if let Some(min) = filter.priority_min {
    qb.push(" AND priority >= ").push_bind(min);
  }
  if let Some(max) = filter.priority_max {
    qb.push(" AND priority <= ").push_bind(max);
  }
  if let Some(at) = filter.created_before {
    qb.push(" AND created_at < ").push_bind(at);
  }
  if let Some(at) = filter.started_before {
    qb.push(" AND started_at < ").push_bind(at);
  }
  if let Some(at) = filter.updated_before {
    qb.push(" AND updated_at < ").push_bind(at);
  }
  if let Some(at) = filter.updated_after {
    qb.push(" AND updated_at > ").push_bind(at);
  }
  if let Some(at) = filter.eligible_at {
    qb.push(" AND scheduled_at <= ").push_bind(at);
  }
  if let Some(at) = filter.unboosted_since {
    qb.push(" AND (boosted_at IS NULL OR boosted_at < ").push_bind(at).push(")");
  }
  if let Some(kind) = filter.error_kind {
    qb.push(" AND error_kind = ").push_bind(kind.as_str());
  }
}

fn push_order_limit(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
  qb.push(match filter.order {
    JobOrder::PriorityThenAge => " ORDER BY priority ASC, created_at ASC, id ASC",
    JobOrder::OldestFirst => " ORDER BY created_at ASC, id ASC",
    JobOrder::RecentlyUpdated => " ORDER BY updated_at DESC, id ASC",
  });
  if let Some(limit) = filter.limit {
    qb.push(" LIMIT ").push_bind(limit.max(0));
  }
}

fn push_job_patch(qb: &mut QueryBuilder<'_, Postgres>, patch: &JobPatch) {
  qb.push("UPDATE crawl_jobs SET updated_at = NOW()");
  if let Some(status) = patch.status {
    qb.push(", status = ").push_bind(status.as_str());
  }
  if let Some(priority) = patch.priority {
    qb.push(", priority = ").push_bind(priority);
  }
  if let Some(attempts) = patch.attempts {
    qb.push(", attempts = ").push_bind(attempts);
  }
  if let Some(at) = patch.scheduled_at {
    qb.push(", scheduled_at = ").push_bind(at);
  }
  if let Some(at) = patch.started_at {
    qb.push(", started_at = ").push_bind(at);
  }
  if let Some(at) = patch.completed_at {
    qb.push(", completed_at = ").push_bind(at);
  }
  if let Some(message) = &patch.error_message {
    qb.push(", error_message = ").push_bind(message.clone());
  }
  if let Some(kind) = patch.error_kind {
    qb.push(", error_kind = ").push_bind(kind.map(|k| k.as_str()));
  }
  if let Some(result) = &patch.result {
    qb.push(", result = ").push_bind(result.clone());
  }
  if let Some(at) = patch.boosted_at {
    qb.push(", boosted_at = ").push_bind(at);
  }
}

#[derive(Clone)]
pub struct PgJobStore {
  pool: PgPool,
}

impl PgJobStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  async fn update_where(
    &self,
    id: Uuid,
    expected: &[JobStatus],
    attempts: Option<i32>,
    patch: &JobPatch,
  ) -> StoreResult<bool> {
    let mut qb = QueryBuilder::<Postgres>::new("");
    push_job_patch(&mut qb, patch);
    qb.push(" WHERE id = ").push_bind(id);
    if !expected.is_empty() {
      qb.push(" AND status = ANY(").push_bind(status_texts(expected)).push(")");
    }
    if let Some(attempts) = attempts {
      qb.push(" AND attempts = ").push_bind(attempts);
    }
    let done = qb.build().execute(&self.pool).await?;
    Ok(done.rows_affected() > 0)
  }
}

#[async_trait]
impl JobStore for PgJobStore {
  async fn insert_job(&self, job: NewJob) -> StoreResult<Uuid> {
    let id = Uuid::new_v4();
    let kind = job.payload.kind();
    let payload = serde_json::to_value(&job.payload)?;
    sqlx::query(
      "INSERT INTO crawl_jobs (id, job_type, payload, status, priority, attempts, max_attempts, scheduled_at, created_at, updated_at)
       VALUES ($1, $2, $3, 'pending', $4, 0, $5, COALESCE($6, NOW()), NOW(), NOW())",
    )
    .bind(id)
    .bind(kind.as_str())
    .bind(payload)
    .bind(job.priority)
    .bind(job.max_attempts)
    .bind(job.scheduled_at)
    .execute(&self.pool)
    .await?;
    Ok(id)
  }

  async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
    let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {} FROM crawl_jobs WHERE id = $1", JOB_COLUMNS))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(Job::try_from).transpose()
  }

  async fn claim_next_pending(&self, limit: i64, max_processing: Option<i64>) -> StoreResult<Vec<Job>> {
    let sql = format!(
      r#"
      WITH next_jobs AS (
        SELECT id
        FROM crawl_jobs
        WHERE status = 'pending' AND scheduled_at <= NOW()
        ORDER BY priority, created_at, id
        LIMIT GREATEST(LEAST($1, $2 - (SELECT COUNT(*) FROM crawl_jobs WHERE status = 'processing')), 0)
        FOR UPDATE SKIP LOCKED
      )
      UPDATE crawl_jobs
      SET status = 'processing', started_at = NOW(), updated_at = NOW()
      WHERE id IN (SELECT id FROM next_jobs) AND status = 'pending'
      RETURNING {}
      "#,
      JOB_COLUMNS
    );
    let mut tx = self.pool.begin().await?;
    if max_processing.is_some() {
      // headroom is read then spent; claimers must not interleave
      sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(CLAIM_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    }
    let rows = sqlx::query_as::<_, JobRow>(&sql)
      .bind(limit)
      .bind(max_processing.unwrap_or(i64::MAX))
      .fetch_all(&mut *tx)
      .await?;
    tx.commit().await?;
    let mut jobs = into_jobs(rows)?;
    jobs.sort_by(|a, b| JobFilter::default().compare(a, b));
    Ok(jobs)
  }

  async fn claim_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
    let sql = format!(
      "UPDATE crawl_jobs SET status = 'processing', started_at = NOW(), updated_at = NOW()
       WHERE id = $1 AND status = 'pending' RETURNING {}",
      JOB_COLUMNS
    );
    let row = sqlx::query_as::<_, JobRow>(&sql).bind(id).fetch_optional(&self.pool).await?;
    row.map(Job::try_from).transpose()
  }

  async fn update_conditional(&self, id: Uuid, expected: &[JobStatus], patch: JobPatch) -> StoreResult<bool> {
    self.update_where(id, expected, None, &patch).await
  }

  async fn update_conditional_attempts(
    &self,
    id: Uuid,
    expected: &[JobStatus],
    attempts: i32,
    patch: JobPatch,
  ) -> StoreResult<bool> {
    self.update_where(id, expected, Some(attempts), &patch).await
  }

  async fn query_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM crawl_jobs", JOB_COLUMNS));
    push_where(&mut qb, filter);
    push_order_limit(&mut qb, filter);
    let rows = qb.build_query_as::<JobRow>().fetch_all(&self.pool).await?;
    into_jobs(rows)
  }

  async fn count_jobs(&self, filter: &JobFilter) -> StoreResult<i64> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM crawl_jobs");
    push_where(&mut qb, filter);
    let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
    Ok(count)
  }

  async fn delete_jobs(&self, filter: &JobFilter) -> StoreResult<u64> {
    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM crawl_jobs WHERE id IN (SELECT id FROM crawl_jobs");
    push_where(&mut qb, filter);
    push_order_limit(&mut qb, filter);
    qb.push(")");
    let done = qb.build().execute(&self.pool).await?;
    Ok(done.rows_affected())
  }

  async fn try_acquire_lock(
    &self,
    domain: &str,
    worker_id: &str,
    max_concurrent: i64,
    ttl: Duration,
  ) -> StoreResult<Option<DomainLock>> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
      .bind(domain)
      .execute(&mut *tx)
      .await?;
    let active: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM domain_locks WHERE domain = $1 AND expires_at > NOW()")
      .bind(domain)
      .fetch_one(&mut *tx)
      .await?;
    if active >= max_concurrent {
      tx.rollback().await?;
      return Ok(None);
    }
    let lock = sqlx::query_as::<_, DomainLock>(
      "INSERT INTO domain_locks (id, domain, worker_id, acquired_at, expires_at)
       VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4))
       RETURNING id, domain, worker_id, acquired_at, expires_at",
    )
    .bind(Uuid::new_v4())
    .bind(domain)
    .bind(worker_id)
    .bind(ttl.as_secs_f64())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(Some(lock))
  }

  async fn release_lock(&self, lock_id: Uuid) -> StoreResult<bool> {
    let done = sqlx::query("DELETE FROM domain_locks WHERE id = $1")
      .bind(lock_id)
      .execute(&self.pool)
      .await?;
    Ok(done.rows_affected() > 0)
  }

  async fn renew_lock(&self, lock_id: Uuid, ttl: Duration) -> StoreResult<bool> {
    let done = sqlx::query(
      "UPDATE domain_locks SET expires_at = NOW() + make_interval(secs => $2)
       WHERE id = $1 AND expires_at > NOW()",
    )
    .bind(lock_id)
    .bind(ttl.as_secs_f64())
    .execute(&self.pool)
    .await?;
    Ok(done.rows_affected() > 0)
  }

  async fn active_locks(&self, domain: &str) -> StoreResult<Vec<DomainLock>> {
    let locks = sqlx::query_as::<_, DomainLock>(
      "SELECT id, domain, worker_id, acquired_at, expires_at FROM domain_locks
       WHERE domain = $1 AND expires_at > NOW() ORDER BY acquired_at",
    )
    .bind(domain)
    .fetch_all(&self.pool)
    .await?;
    Ok(locks)
  }

  async fn delete_expired_locks(&self) -> StoreResult<u64> {
    let done = sqlx::query("DELETE FROM domain_locks WHERE expires_at <= NOW()")
      .execute(&self.pool)
      .await?;
    Ok(done.rows_affected())
  }

  async fn insert_session(&self, session: &CrawlSession) -> StoreResult<()> {
    sqlx::query(&format!(
      "INSERT INTO crawl_sessions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
      SESSION_COLUMNS
    ))
    .bind(session.id)
    .bind(session.parent_source_id)
    .bind(&session.start_url)
    .bind(session.status.as_str())
    .bind(session.total_pages)
    .bind(session.processed_pages)
    .bind(session.failed_pages)
    .bind(session.total_batches)
    .bind(session.completed_batches)
    .bind(session.failed_batches)
    .bind(&session.metadata)
    .bind(&session.error_message)
    .bind(session.created_at)
    .bind(session.updated_at)
    .bind(session.completed_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_session(&self, id: Uuid) -> StoreResult<Option<CrawlSession>> {
    let row = sqlx::query_as::<_, SessionRow>(&format!("SELECT {} FROM crawl_sessions WHERE id = $1", SESSION_COLUMNS))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(CrawlSession::try_from).transpose()
  }

  async fn update_session(&self, id: Uuid, expected: &[SessionStatus], patch: SessionPatch) -> StoreResult<bool> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE crawl_sessions SET updated_at = NOW()");
    if let Some(status) = patch.status {
      qb.push(", status = ").push_bind(status.as_str());
    }
    for (column, value) in [
      ("total_pages", patch.total_pages),
      ("processed_pages", patch.processed_pages),
      ("failed_pages", patch.failed_pages),
      ("total_batches", patch.total_batches),
      ("completed_batches", patch.completed_batches),
      ("failed_batches", patch.failed_batches),
    ] {
      if let Some(value) = value {
        qb.push(format!(", {} = ", column)).push_bind(value);
      }
    }
    if let Some(metadata) = patch.metadata {
      qb.push(", metadata = ").push_bind(metadata);
    }
    if let Some(message) = patch.error_message {
      qb.push(", error_message = ").push_bind(message);
    }
    if let Some(at) = patch.completed_at {
      qb.push(", completed_at = ").push_bind(at);
    }
    qb.push(" WHERE id = ").push_bind(id);
    if !expected.is_empty() {
      let statuses: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
      qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    let done = qb.build().execute(&self.pool).await?;
    Ok(done.rows_affected() > 0)
  }

  async fn list_sessions(&self, statuses: &[SessionStatus]) -> StoreResult<Vec<CrawlSession>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM crawl_sessions WHERE TRUE", SESSION_COLUMNS));
    if !statuses.is_empty() {
      let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
      qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    qb.push(" ORDER BY created_at");
    let rows = qb.build_query_as::<SessionRow>().fetch_all(&self.pool).await?;
    rows.into_iter().map(CrawlSession::try_from).collect()
  }
}
