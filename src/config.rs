use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use uuid::Uuid;

use crate::dead_letter::DeadLetterConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::queue::QueueConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::recovery::RecoveryConfig;
use crate::starvation::{SchedulingPolicy, StarvationConfig};
use crate::worker_scheduler::ManagerConfig;

/// Extra time the dispatch loop allows past the batch timeout, so the worker's
/// own timeout path gets to release its domain lease first.
const DISPATCH_GRACE: Duration = Duration::from_secs(10);

/// How far past the dispatch timeout a processing job must be before another
/// process treats it as stalled.
const STALE_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: Option<String>,
  pub server_port: u16,
  pub worker_id: String,
  pub db_max_connections: u32,
  pub batch_timeout: Duration,
  pub queue: QueueConfig,
  pub rate_limit: RateLimitConfig,
  pub heartbeat: HeartbeatConfig,
  pub starvation: StarvationConfig,
  pub dead_letter: DeadLetterConfig,
  pub recovery: RecoveryConfig,
  pub orchestrator: OrchestratorConfig,
  pub manager: ManagerConfig,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let database_url = lookup("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;
    let rabbitmq_url = lookup("RABBITMQ_URL").filter(|url| !url.trim().is_empty());
    let worker_id = lookup("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));

    let queue = QueueConfig {
      max_attempts: parsed(&lookup, "CRAWLQ_MAX_ATTEMPTS", 3)?,
      ..Default::default()
    };

    let mut rate_limit = RateLimitConfig::default();
    rate_limit.defaults.max_concurrent = parsed(&lookup, "CRAWLQ_DOMAIN_MAX_CONCURRENT", 2)?;
    rate_limit.defaults.requests_per_second = parsed(&lookup, "CRAWLQ_REQUESTS_PER_SECOND", 1.0)?;
    rate_limit.lease_ttl = Duration::from_secs(parsed(&lookup, "CRAWLQ_DOMAIN_LOCK_TTL_SECS", 30)?);
    if let Some(raw) = lookup("CRAWLQ_DOMAIN_LIMITS") {
      rate_limit.overrides = RateLimitConfig::parse_overrides(&raw)
        .map_err(|e| anyhow!(e))
        .context("invalid CRAWLQ_DOMAIN_LIMITS")?;
    }

    let starvation = StarvationConfig {
      policy: match lookup("CRAWLQ_SCHEDULING_POLICY") {
        Some(value) => value
          .parse::<SchedulingPolicy>()
          .map_err(|e| anyhow!(e))
          .context("invalid CRAWLQ_SCHEDULING_POLICY")?,
        None => SchedulingPolicy::default(),
      },
      ..Default::default()
    };

    let dead_letter = DeadLetterConfig {
      retention: Duration::from_secs(parsed::<u64>(&lookup, "CRAWLQ_DEAD_LETTER_RETENTION_DAYS", 30)? * 24 * 60 * 60),
      ..Default::default()
    };

    let batch_timeout = Duration::from_secs(parsed(&lookup, "CRAWLQ_JOB_TIMEOUT_SECS", 300)?);
    let manager = ManagerConfig {
      poll_interval: Duration::from_millis(parsed(&lookup, "CRAWLQ_POLL_INTERVAL_MS", 2000)?),
      max_concurrent: parsed(&lookup, "CRAWLQ_MAX_CONCURRENT_JOBS", 4)?,
      job_timeout: batch_timeout + DISPATCH_GRACE,
      ..Default::default()
    };
    if manager.max_concurrent == 0 {
      return Err(anyhow!("CRAWLQ_MAX_CONCURRENT_JOBS must be at least 1"));
    }

    let stale_after = manager.job_timeout + STALE_MARGIN;
    let recovery = RecoveryConfig {
      interval: Duration::from_secs(parsed(&lookup, "CRAWLQ_RECOVERY_INTERVAL_SECS", 60)?),
      stale_threshold: stale_after,
      ..Default::default()
    };
    let heartbeat = HeartbeatConfig { processing_timeout: stale_after, ..Default::default() };

    Ok(Self {
      database_url,
      rabbitmq_url,
      server_port: parsed(&lookup, "SERVER_PORT", 8080)?,
      worker_id,
      db_max_connections: parsed(&lookup, "CRAWLQ_DB_MAX_CONNECTIONS", 10)?,
      batch_timeout,
      queue,
      rate_limit,
      heartbeat,
      starvation,
      dead_letter,
      recovery,
      orchestrator: OrchestratorConfig::default(),
      manager,
    })
  }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: Display,
{
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse::<T>()
      .map_err(|e| anyhow!("invalid {} value '{}': {}", key, raw, e)),
    None => Ok(default),
  }
}
