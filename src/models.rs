use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, StoreError};

pub const PRIORITY_MIN: i32 = 1;
pub const PRIORITY_MAX: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Pending,
  Processing,
  Completed,
  Failed,
  DeadLetter,
}

impl JobStatus {
  pub const ALL: [JobStatus; 5] = [
    JobStatus::Pending,
    JobStatus::Processing,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::DeadLetter,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::Processing => "processing",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
      JobStatus::DeadLetter => "dead_letter",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLetter)
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    JobStatus::ALL
      .into_iter()
      .find(|status| status.as_str() == s)
      .ok_or_else(|| StoreError::InvalidValue { field: "status", value: s.to_string() })
  }
}

/// Named priority levels. Lower numeric value is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
  Critical,
  High,
  Normal,
  Low,
  Background,
}

impl JobPriority {
  pub fn value(&self) -> i32 {
    match self {
      JobPriority::Critical => 1,
      JobPriority::High => 10,
      JobPriority::Normal => 100,
      JobPriority::Low => 500,
      JobPriority::Background => 1000,
    }
  }
}

impl FromStr for JobPriority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "critical" => Ok(JobPriority::Critical),
      "high" => Ok(JobPriority::High),
      "normal" => Ok(JobPriority::Normal),
      "low" => Ok(JobPriority::Low),
      "background" => Ok(JobPriority::Background),
      other => Err(format!("unknown priority '{}'", other)),
    }
  }
}

/// Coarse grouping of numeric priorities used for statistics and fair scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBand {
  High,
  Normal,
  Low,
}

impl PriorityBand {
  pub const ALL: [PriorityBand; 3] = [PriorityBand::High, PriorityBand::Normal, PriorityBand::Low];

  pub fn of(priority: i32) -> Self {
    if priority <= JobPriority::High.value() {
      PriorityBand::High
    } else if priority <= JobPriority::Normal.value() {
      PriorityBand::Normal
    } else {
      PriorityBand::Low
    }
  }

  /// Inclusive numeric range covered by the band.
  pub fn range(&self) -> (i32, i32) {
    match self {
      PriorityBand::High => (PRIORITY_MIN, JobPriority::High.value()),
      PriorityBand::Normal => (JobPriority::High.value() + 1, JobPriority::Normal.value()),
      PriorityBand::Low => (JobPriority::Normal.value() + 1, PRIORITY_MAX),
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      PriorityBand::High => "high",
      PriorityBand::Normal => "normal",
      PriorityBand::Low => "low",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
  CrawlBatch,
  Generic,
}

impl JobKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobKind::CrawlBatch => "crawl-batch",
      JobKind::Generic => "generic",
    }
  }
}

impl fmt::Display for JobKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobKind {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "crawl-batch" => Ok(JobKind::CrawlBatch),
      "generic" => Ok(JobKind::Generic),
      other => Err(StoreError::InvalidValue { field: "job_type", value: other.to_string() }),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlBatchPayload {
  pub session_id: Uuid,
  pub parent_source_id: Uuid,
  pub domain: String,
  pub urls: Vec<String>,
  pub batch_index: u32,
  pub total_batches: u32,
}

/// Typed job payload. The tag doubles as the `job_type` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
  CrawlBatch(CrawlBatchPayload),
  Generic {
    name: String,
    #[serde(default)]
    data: serde_json::Value,
  },
}

impl JobPayload {
  pub fn kind(&self) -> JobKind {
    match self {
      JobPayload::CrawlBatch(_) => JobKind::CrawlBatch,
      JobPayload::Generic { .. } => JobKind::Generic,
    }
  }

  pub fn session_id(&self) -> Option<Uuid> {
    match self {
      JobPayload::CrawlBatch(batch) => Some(batch.session_id),
      JobPayload::Generic { .. } => None,
    }
  }

  /// Number of work items carried, used for priority assignment.
  pub fn batch_size(&self) -> usize {
    match self {
      JobPayload::CrawlBatch(batch) => batch.urls.len(),
      JobPayload::Generic { .. } => 1,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: Uuid,
  pub payload: JobPayload,
  pub status: JobStatus,
  pub priority: i32,
  pub attempts: i32,
  pub max_attempts: i32,
  pub scheduled_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub error_message: Option<String>,
  pub error_kind: Option<ErrorKind>,
  pub result: Option<serde_json::Value>,
  /// Last starvation boost; aging restarts from here.
  pub boosted_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Job {
  pub fn kind(&self) -> JobKind {
    self.payload.kind()
  }

  pub fn band(&self) -> PriorityBand {
    PriorityBand::of(self.priority)
  }

  pub fn attempts_exhausted(&self) -> bool {
    self.attempts >= self.max_attempts
  }

  /// Whether one more failed attempt would exhaust the retry budget.
  pub fn is_last_attempt(&self) -> bool {
    self.attempts + 1 >= self.max_attempts
  }

  pub fn wait_time(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.created_at
  }
}

#[derive(Debug, Clone)]
pub struct NewJob {
  pub payload: JobPayload,
  pub priority: i32,
  pub max_attempts: i32,
  pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
  pub fn new(payload: JobPayload) -> Self {
    Self {
      payload,
      priority: JobPriority::Normal.value(),
      max_attempts: 3,
      scheduled_at: None,
    }
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority.clamp(PRIORITY_MIN, PRIORITY_MAX);
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
    self.scheduled_at = Some(at);
    self
  }

  pub fn into_job(self, id: Uuid, now: DateTime<Utc>) -> Job {
    Job {
      id,
      payload: self.payload,
      status: JobStatus::Pending,
      priority: self.priority,
      attempts: 0,
      max_attempts: self.max_attempts,
      scheduled_at: self.scheduled_at.unwrap_or(now),
      started_at: None,
      completed_at: None,
      error_message: None,
      error_kind: None,
      result: None,
      boosted_at: None,
      created_at: now,
      updated_at: now,
    }
  }
}

/// Partial update of a job row. `None` leaves the column untouched; the nested
/// options on nullable columns allow clearing them.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
  pub status: Option<JobStatus>,
  pub priority: Option<i32>,
  pub attempts: Option<i32>,
  pub scheduled_at: Option<DateTime<Utc>>,
  pub started_at: Option<Option<DateTime<Utc>>>,
  pub completed_at: Option<Option<DateTime<Utc>>>,
  pub error_message: Option<Option<String>>,
  pub error_kind: Option<Option<ErrorKind>>,
  pub result: Option<Option<serde_json::Value>>,
  pub boosted_at: Option<DateTime<Utc>>,
}

impl JobPatch {
  pub fn with_status(mut self, status: JobStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = Some(priority);
    self
  }

  pub fn with_attempts(mut self, attempts: i32) -> Self {
    self.attempts = Some(attempts);
    self
  }

  pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
    self.scheduled_at = Some(at);
    self
  }

  pub fn with_started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
    self.started_at = Some(at);
    self
  }

  pub fn with_completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
    self.completed_at = Some(at);
    self
  }

  pub fn with_error(mut self, message: Option<String>, kind: Option<ErrorKind>) -> Self {
    self.error_message = Some(message);
    self.error_kind = Some(kind);
    self
  }

  pub fn with_result(mut self, result: Option<serde_json::Value>) -> Self {
    self.result = Some(result);
    self
  }

  pub fn with_boosted_at(mut self, at: DateTime<Utc>) -> Self {
    self.boosted_at = Some(at);
    self
  }

  pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
    if let Some(status) = self.status {
      job.status = status;
    }
    if let Some(priority) = self.priority {
      job.priority = priority;
    }
    if let Some(attempts) = self.attempts {
      job.attempts = attempts;
    }
    if let Some(at) = self.scheduled_at {
      job.scheduled_at = at;
    }
    if let Some(at) = self.started_at {
      job.started_at = at;
    }
    if let Some(at) = self.completed_at {
      job.completed_at = at;
    }
    if let Some(message) = &self.error_message {
      job.error_message = message.clone();
    }
    if let Some(kind) = self.error_kind {
      job.error_kind = kind;
    }
    if let Some(result) = &self.result {
      job.result = result.clone();
    }
    if let Some(at) = self.boosted_at {
      job.boosted_at = Some(at);
    }
    job.updated_at = now;
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
  /// Most urgent first, oldest first within equal priority.
  #[default]
  PriorityThenAge,
  OldestFirst,
  RecentlyUpdated,
}

/// Row filter shared by queries, counts and deletes.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
  pub statuses: Vec<JobStatus>,
  pub kind: Option<JobKind>,
  pub session_id: Option<Uuid>,
  pub priority_min: Option<i32>,
  pub priority_max: Option<i32>,
  pub created_before: Option<DateTime<Utc>>,
  pub started_before: Option<DateTime<Utc>>,
  pub updated_before: Option<DateTime<Utc>>,
  pub updated_after: Option<DateTime<Utc>>,
  pub eligible_at: Option<DateTime<Utc>>,
  /// Never boosted, or last boosted before this instant.
  pub unboosted_since: Option<DateTime<Utc>>,
  pub error_kind: Option<ErrorKind>,
  pub order: JobOrder,
  pub limit: Option<i64>,
}

impl JobFilter {
  pub fn status(status: JobStatus) -> Self {
    Self { statuses: vec![status], ..Default::default() }
  }

  pub fn statuses(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
    Self { statuses: statuses.into_iter().collect(), ..Default::default() }
  }

  pub fn kind(mut self, kind: JobKind) -> Self {
    self.kind = Some(kind);
    self
  }

  pub fn session(mut self, session_id: Uuid) -> Self {
    self.session_id = Some(session_id);
    self
  }

  pub fn band(mut self, band: PriorityBand) -> Self {
    let (min, max) = band.range();
    self.priority_min = Some(min);
    self.priority_max = Some(max);
    self
  }

  pub fn priority_above(mut self, priority: i32) -> Self {
    self.priority_min = Some(priority + 1);
    self
  }

  pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
    self.created_before = Some(at);
    self
  }

  pub fn started_before(mut self, at: DateTime<Utc>) -> Self {
    self.started_before = Some(at);
    self
  }

  pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
    self.updated_before = Some(at);
    self
  }

  pub fn updated_after(mut self, at: DateTime<Utc>) -> Self {
    self.updated_after = Some(at);
    self
  }

  /// Only rows whose `scheduled_at` has passed at `at`.
  pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
    self.eligible_at = Some(at);
    self
  }

  pub fn unboosted_since(mut self, at: DateTime<Utc>) -> Self {
    self.unboosted_since = Some(at);
    self
  }

  pub fn error_kind(mut self, kind: ErrorKind) -> Self {
    self.error_kind = Some(kind);
    self
  }

  pub fn order(mut self, order: JobOrder) -> Self {
    self.order = order;
    self
  }

  pub fn limit(mut self, limit: i64) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, job: &Job) -> bool {
    if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
      return false;
    }
    if self.kind.is_some_and(|kind| kind != job.kind()) {
      return false;
    }
    if self.session_id.is_some() && self.session_id != job.payload.session_id() {
      return false;
    }
    if self.priority_min.is_some_and(|min| job.priority < min) {
      return false;
    }
    if self.priority_max.is_some_and(|max| job.priority > max) {
      return false;
    }
    if self.created_before.is_some_and(|at| job.created_at >= at) {
      return false;
    }
    if let Some(at) = self.started_before {
      if !job.started_at.is_some_and(|started| started < at) {
        return false;
      }
    }
    if self.updated_before.is_some_and(|at| job.updated_at >= at) {
      return false;
    }
    if self.updated_after.is_some_and(|at| job.updated_at <= at) {
      return false;
    }
    if self.eligible_at.is_some_and(|at| job.scheduled_at > at) {
      return false;
    }
    if let Some(at) = self.unboosted_since {
      if job.boosted_at.is_some_and(|boosted| boosted >= at) {
        return false;
      }
    }
    if self.error_kind.is_some() && self.error_kind != job.error_kind {
      return false;
    }
    true
  }

  pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
    match self.order {
      JobOrder::PriorityThenAge => a
        .priority
        .cmp(&b.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id)),
      JobOrder::OldestFirst => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
      JobOrder::RecentlyUpdated => b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)),
    }
  }
}

/// Time-boxed lease on a crawl target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainLock {
  pub id: Uuid,
  pub domain: String,
  pub worker_id: String,
  pub acquired_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl DomainLock {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
  Pending,
  Discovering,
  Crawling,
  Completed,
  Failed,
}

impl SessionStatus {
  pub const ALL: [SessionStatus; 5] = [
    SessionStatus::Pending,
    SessionStatus::Discovering,
    SessionStatus::Crawling,
    SessionStatus::Completed,
    SessionStatus::Failed,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      SessionStatus::Pending => "pending",
      SessionStatus::Discovering => "discovering",
      SessionStatus::Crawling => "crawling",
      SessionStatus::Completed => "completed",
      SessionStatus::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, SessionStatus::Completed | SessionStatus::Failed)
  }

  pub fn can_transition_to(&self, next: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
      (self, next),
      (Pending, Discovering)
        | (Pending, Failed)
        | (Discovering, Crawling)
        | (Discovering, Failed)
        | (Crawling, Completed)
        | (Crawling, Failed)
    )
  }
}

impl fmt::Display for SessionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SessionStatus {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    SessionStatus::ALL
      .into_iter()
      .find(|status| status.as_str() == s)
      .ok_or_else(|| StoreError::InvalidValue { field: "session status", value: s.to_string() })
  }
}

/// One logical crawl request and the aggregate over its batch jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlSession {
  pub id: Uuid,
  pub parent_source_id: Uuid,
  pub start_url: String,
  pub status: SessionStatus,
  pub total_pages: i32,
  pub processed_pages: i32,
  pub failed_pages: i32,
  pub total_batches: i32,
  pub completed_batches: i32,
  pub failed_batches: i32,
  pub metadata: serde_json::Value,
  pub error_message: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl CrawlSession {
  pub fn new(parent_source_id: Uuid, start_url: impl Into<String>, domain: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      parent_source_id,
      start_url: start_url.into(),
      status: SessionStatus::Pending,
      total_pages: 0,
      processed_pages: 0,
      failed_pages: 0,
      total_batches: 0,
      completed_batches: 0,
      failed_batches: 0,
      metadata: serde_json::json!({ "domain": domain.into() }),
      error_message: None,
      created_at: now,
      updated_at: now,
      completed_at: None,
    }
  }

  pub fn domain(&self) -> Option<&str> {
    self.metadata.get("domain").and_then(|v| v.as_str())
  }

  pub fn percent_complete(&self) -> u8 {
    if self.total_pages <= 0 {
      return 0;
    }
    let done = (self.processed_pages + self.failed_pages).min(self.total_pages);
    ((done as f64 / self.total_pages as f64) * 100.0).round() as u8
  }
}

#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
  pub status: Option<SessionStatus>,
  pub total_pages: Option<i32>,
  pub processed_pages: Option<i32>,
  pub failed_pages: Option<i32>,
  pub total_batches: Option<i32>,
  pub completed_batches: Option<i32>,
  pub failed_batches: Option<i32>,
  pub metadata: Option<serde_json::Value>,
  pub error_message: Option<Option<String>>,
  pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl SessionPatch {
  pub fn status(status: SessionStatus) -> Self {
    Self { status: Some(status), ..Default::default() }
  }

  pub fn apply(&self, session: &mut CrawlSession, now: DateTime<Utc>) {
    if let Some(status) = self.status {
      session.status = status;
    }
    if let Some(v) = self.total_pages {
      session.total_pages = v;
    }
    if let Some(v) = self.processed_pages {
      session.processed_pages = v;
    }
    if let Some(v) = self.failed_pages {
      session.failed_pages = v;
    }
    if let Some(v) = self.total_batches {
      session.total_batches = v;
    }
    if let Some(v) = self.completed_batches {
      session.completed_batches = v;
    }
    if let Some(v) = self.failed_batches {
      session.failed_batches = v;
    }
    if let Some(metadata) = &self.metadata {
      session.metadata = metadata.clone();
    }
    if let Some(message) = &self.error_message {
      session.error_message = message.clone();
    }
    if let Some(at) = self.completed_at {
      session.completed_at = at;
    }
    session.updated_at = now;
  }
}

/// Outcome of fetching a single URL within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
  pub url: String,
  pub success: bool,
  pub status_code: Option<u16>,
  pub bytes: Option<u64>,
  pub error: Option<String>,
  pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
  pub pages: Vec<PageResult>,
}

impl BatchResult {
  pub fn succeeded(&self) -> usize {
    self.pages.iter().filter(|p| p.success).count()
  }

  pub fn failed(&self) -> usize {
    self.pages.len() - self.succeeded()
  }
}
