use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("invalid {field} value in store: {value}")]
  InvalidValue { field: &'static str, value: String },
  #[error("not found: {0}")]
  NotFound(String),
}

/// Classification of the last failure, persisted alongside the job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Retryable,
  NonRetryable,
  Timeout,
  Stalled,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Retryable => "retryable",
      ErrorKind::NonRetryable => "non_retryable",
      ErrorKind::Timeout => "timeout",
      ErrorKind::Stalled => "stalled",
    }
  }

  /// Only explicitly fatal failures skip the retry budget.
  pub fn should_retry(&self) -> bool {
    !matches!(self, ErrorKind::NonRetryable)
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ErrorKind {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "retryable" => Ok(ErrorKind::Retryable),
      "non_retryable" => Ok(ErrorKind::NonRetryable),
      "timeout" => Ok(ErrorKind::Timeout),
      "stalled" => Ok(ErrorKind::Stalled),
      other => Err(StoreError::InvalidValue { field: "error_kind", value: other.to_string() }),
    }
  }
}

/// Failure of a single job execution.
#[derive(Debug, Error)]
pub enum JobError {
  #[error("transient failure: {0}")]
  Transient(String),
  #[error("fatal failure: {0}")]
  Fatal(String),
  #[error("job timed out after {0:?}")]
  Timeout(Duration),
  #[error("no executor registered for job type {0}")]
  UnknownJobType(String),
  #[error(transparent)]
  Store(#[from] StoreError),
}

impl JobError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      JobError::Transient(_) | JobError::Store(_) => ErrorKind::Retryable,
      JobError::Fatal(_) | JobError::UnknownJobType(_) => ErrorKind::NonRetryable,
      JobError::Timeout(_) => ErrorKind::Timeout,
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.kind().should_retry()
  }
}
