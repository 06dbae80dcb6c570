//! Health registry: per-gateway circuit-breaker state.
//!
//! Tracks failures per origin and opens a circuit once a threshold is
//! crossed, with a half-open probe window before a gateway is trusted
//! again.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::{GatewayHealth, Origin};

/// Verification faults are weighted more heavily than plain availability
/// faults, since they may indicate an adversarial gateway rather than a
/// transiently unreachable one.
pub const VERIFICATION_FAILURE_WEIGHT: u32 = 3;

pub struct HealthRegistryConfig {
  pub health_ttl_ms: u64,
  pub circuit_breaker_threshold: u32,
  pub circuit_breaker_reset_ms: u64,
  pub max_entries: usize,
}

impl Default for HealthRegistryConfig {
  fn default() -> Self {
    Self {
      health_ttl_ms: 5 * 60_000,
      circuit_breaker_threshold: 3,
      circuit_breaker_reset_ms: 30_000,
      max_entries: 1000,
    }
  }
}

pub struct HealthRegistry {
  entries: DashMap<Origin, GatewayHealth>,
  config: HealthRegistryConfig,
  last_prune: std::sync::Mutex<Instant>,
}

impl HealthRegistry {
  pub fn new(config: HealthRegistryConfig) -> Self {
    Self {
      entries: DashMap::new(),
      last_prune: std::sync::Mutex::new(Instant::now()),
      config,
    }
  }

  /// Unknown gateways, and entries whose `lastChecked` has aged out past
  /// `healthTtlMs`, are treated healthy by default.
  pub fn is_healthy(&self, origin: &str) -> bool {
    match self.entries.get(origin) {
      Some(entry) => {
        if self.is_stale(&entry) {
          return true;
        }
        if entry.circuit_open {
          match entry.circuit_open_until {
            Some(until) if Instant::now() > until => true, // HALF_OPEN: allow a probe
            _ => false,
          }
        } else {
          entry.healthy
        }
      }
      None => true,
    }
  }

  pub fn filter_healthy<'a, T>(&self, items: &'a [T], origin_of: impl Fn(&T) -> &str) -> Vec<&'a T> {
    items.iter().filter(|item| self.is_healthy(origin_of(item))).collect()
  }

  pub fn mark_healthy(&self, origin: &str) {
    self.maybe_prune();
    self.entries.insert(origin.to_string(), GatewayHealth::fresh());
  }

  /// Records a failure, weighted by `weight` (default 1; verification
  /// failures pass `VERIFICATION_FAILURE_WEIGHT`). Opens the circuit once
  /// `failures >= circuit_breaker_threshold`.
  pub fn record_failure(&self, origin: &str, weight: u32) {
    self.maybe_prune();
    let mut entry = self
      .entries
      .entry(origin.to_string())
      .or_insert_with(GatewayHealth::fresh);

    if self.is_stale(&entry) {
      *entry = GatewayHealth::fresh();
    }

    entry.failures = entry.failures.saturating_add(weight);
    entry.last_checked = Instant::now();
    entry.healthy = false;

    if entry.failures >= self.config.circuit_breaker_threshold {
      entry.circuit_open = true;
      entry.circuit_open_until =
        Some(Instant::now() + Duration::from_millis(self.config.circuit_breaker_reset_ms));
      debug!(origin, failures = entry.failures, "circuit opened");
    }
  }

  pub fn mark_unhealthy(&self, origin: &str, duration_ms: Option<u64>) {
    self.maybe_prune();
    let mut entry = self
      .entries
      .entry(origin.to_string())
      .or_insert_with(GatewayHealth::fresh);
    entry.healthy = false;
    entry.last_checked = Instant::now();
    if let Some(ms) = duration_ms {
      entry.circuit_open = true;
      entry.circuit_open_until = Some(Instant::now() + Duration::from_millis(ms));
    }
  }

  pub fn clear(&self) {
    self.entries.clear();
  }

  fn is_stale(&self, entry: &GatewayHealth) -> bool {
    entry.last_checked.elapsed() > Duration::from_millis(self.config.health_ttl_ms)
  }

  fn maybe_prune(&self) {
    let mut last_prune = self.last_prune.lock().unwrap();
    let ttl = Duration::from_millis(self.config.health_ttl_ms);
    if last_prune.elapsed() < ttl {
      return;
    }
    *last_prune = Instant::now();
    drop(last_prune);
    self.prune();
  }

  fn priority(&self, entry: &GatewayHealth) -> u8 {
    if entry.circuit_open && entry.circuit_open_until.map(|u| Instant::now() <= u).unwrap_or(true) {
      4
    } else if !entry.healthy {
      3
    } else if entry.failures > 0 {
      2
    } else {
      1
    }
  }

  fn prune(&self) {
    let double_ttl = Duration::from_millis(self.config.health_ttl_ms * 2);
    self
      .entries
      .retain(|_, entry| entry.last_checked.elapsed() <= double_ttl);

    if self.entries.len() <= self.config.max_entries {
      return;
    }

    let mut ranked: Vec<(Origin, u8, Instant)> = self
      .entries
      .iter()
      .map(|e| (e.key().clone(), self.priority(e.value()), e.value().last_checked))
      .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

    let overflow = self.entries.len() - self.config.max_entries;
    for (origin, _, _) in ranked.into_iter().take(overflow) {
      self.entries.remove(&origin);
    }
  }

  #[cfg(test)]
  pub fn failures(&self, origin: &str) -> u32 {
    self.entries.get(origin).map(|e| e.failures).unwrap_or(0)
  }
}
