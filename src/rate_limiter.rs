//! Per-domain concurrency leases and request pacing.
//!
//! Leases are rows in the shared store with an expiry, so a worker that dies
//! while holding one only blocks the domain until the lease runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::DomainLock;
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainLimits {
  pub max_concurrent: u32,
  pub requests_per_second: f64,
}

impl Default for DomainLimits {
  fn default() -> Self {
    Self { max_concurrent: 2, requests_per_second: 1.0 }
  }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
  pub defaults: DomainLimits,
  /// Must outlast a normal batch so live work is never preempted.
  pub lease_ttl: Duration,
  pub overrides: HashMap<String, DomainLimits>,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      defaults: DomainLimits::default(),
      lease_ttl: Duration::from_secs(30),
      overrides: HashMap::new(),
    }
  }
}

impl RateLimitConfig {
  pub fn limits_for(&self, domain: &str) -> DomainLimits {
    self.overrides.get(&normalize_domain(domain)).copied().unwrap_or(self.defaults)
  }

  pub fn with_override(mut self, domain: &str, limits: DomainLimits) -> Self {
    self.overrides.insert(normalize_domain(domain), limits);
    self
  }

  /// Parses `example.com=1:2.0,other.org=3:0.5` into per-domain limits.
  pub fn parse_overrides(raw: &str) -> Result<HashMap<String, DomainLimits>, String> {
    let mut overrides = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
      let (domain, limits) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected domain=max:rps, got '{}'", entry))?;
      let (max, rps) = limits
        .split_once(':')
        .ok_or_else(|| format!("expected max:rps for '{}'", domain))?;
      let max_concurrent = max
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("bad max_concurrent for '{}': {}", domain, e))?;
      let requests_per_second = rps
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad requests_per_second for '{}': {}", domain, e))?;
      overrides.insert(normalize_domain(domain), DomainLimits { max_concurrent, requests_per_second });
    }
    Ok(overrides)
  }
}

pub fn normalize_domain(domain: &str) -> String {
  domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// A held domain lease. Call [`DomainLease::release`] when done; dropping an
/// unreleased lease (panic, cancellation) spawns the release instead.
pub struct DomainLease {
  lock: DomainLock,
  store: Arc<dyn JobStore>,
  released: bool,
}

impl DomainLease {
  pub fn lock(&self) -> &DomainLock {
    &self.lock
  }

  pub async fn release(mut self) -> Result<bool, StoreError> {
    self.released = true;
    let removed = self.store.release_lock(self.lock.id).await?;
    debug!(domain = %self.lock.domain, lock_id = %self.lock.id, "domain lock released");
    Ok(removed)
  }
}

impl Drop for DomainLease {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    let store = self.store.clone();
    let lock_id = self.lock.id;
    let domain = self.lock.domain.clone();
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          if let Err(e) = store.release_lock(lock_id).await {
            warn!(domain = %domain, lock_id = %lock_id, error = %e, "failed to release dropped domain lock");
          }
        });
      }
      Err(_) => warn!(domain = %domain, lock_id = %lock_id, "domain lock dropped outside runtime, left to expire"),
    }
  }
}

pub struct DomainRateLimiter {
  store: Arc<dyn JobStore>,
  config: RateLimitConfig,
  worker_id: String,
}

impl DomainRateLimiter {
  pub fn new(store: Arc<dyn JobStore>, config: RateLimitConfig, worker_id: impl Into<String>) -> Self {
    Self { store, config, worker_id: worker_id.into() }
  }

  pub fn config(&self) -> &RateLimitConfig {
    &self.config
  }

  /// Returns `None` when the domain is saturated; callers back off rather than wait.
  pub async fn acquire_domain_lock(&self, domain: &str) -> Result<Option<DomainLease>, StoreError> {
    let domain = normalize_domain(domain);
    let limits = self.config.limits_for(&domain);
    let lock = self
      .store
      .try_acquire_lock(&domain, &self.worker_id, i64::from(limits.max_concurrent), self.config.lease_ttl)
      .await?;
    match lock {
      Some(lock) => {
        debug!(domain = %domain, lock_id = %lock.id, worker_id = %self.worker_id, "domain lock acquired");
        Ok(Some(DomainLease { lock, store: self.store.clone(), released: false }))
      }
      None => {
        debug!(domain = %domain, max = limits.max_concurrent, "domain saturated");
        Ok(None)
      }
    }
  }

  pub async fn release_domain_lock(&self, lease: DomainLease) -> Result<bool, StoreError> {
    lease.release().await
  }

  /// Extends a held lease by another `lease_ttl`. `false` means it already
  /// lapsed and the domain may have been handed to someone else.
  pub async fn renew_domain_lock(&self, lease: &DomainLease) -> Result<bool, StoreError> {
    let renewed = self.store.renew_lock(lease.lock.id, self.config.lease_ttl).await?;
    if !renewed {
      warn!(domain = %lease.lock.domain, lock_id = %lease.lock.id, "domain lock lapsed before renewal");
    }
    Ok(renewed)
  }

  /// How often a holder should renew so the lease never lapses mid-batch.
  pub fn renew_interval(&self) -> Duration {
    (self.config.lease_ttl / 3).max(Duration::from_millis(10))
  }

  pub fn rate_limit_delay(&self, domain: &str) -> Duration {
    let rps = self.config.limits_for(domain).requests_per_second;
    if rps <= 0.0 || !rps.is_finite() {
      return Duration::ZERO;
    }
    Duration::from_secs_f64(1.0 / rps)
  }

  /// Single-token pacing: one fixed pause before each request to the domain.
  pub async fn wait_for_rate_limit(&self, domain: &str) {
    let delay = self.rate_limit_delay(domain);
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
  }

  pub async fn cleanup_expired_locks(&self) -> Result<u64, StoreError> {
    let removed = self.store.delete_expired_locks().await?;
    if removed > 0 {
      info!(removed, "expired domain locks cleaned up");
    }
    Ok(removed)
  }

  pub async fn active_locks(&self, domain: &str) -> Result<Vec<DomainLock>, StoreError> {
    self.store.active_locks(&normalize_domain(domain)).await
  }
}
