//! Health-aware selector: filters the pool by health, delegates the final
//! pick to a routing strategy, and widens the candidate set on exhaustion.
//!
//! Widening happens in three tiers: healthy gateways first, then the full
//! pool minus any explicitly excluded origins, then the full pool
//! unconditionally, so a request only fails once every gateway has been
//! tried.

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::RoutingStrategy;
use crate::health::HealthRegistry;
use crate::temperature::TemperatureStore;
use crate::types::GatewayInfo;

#[async_trait::async_trait]
pub trait SelectionStrategy: Send + Sync {
  async fn pick(&self, candidates: &[GatewayInfo], path: &str, subdomain: &str) -> Option<String>;
}

pub struct RandomStrategy;

#[async_trait::async_trait]
impl SelectionStrategy for RandomStrategy {
  async fn pick(&self, candidates: &[GatewayInfo], _path: &str, _subdomain: &str) -> Option<String> {
    if candidates.is_empty() {
      return None;
    }
    let index = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[index].origin.clone())
  }
}

pub struct RoundRobinStrategy {
  counter: AtomicUsize,
}

impl RoundRobinStrategy {
  pub fn new() -> Self {
    Self { counter: AtomicUsize::new(0) }
  }
}

#[async_trait::async_trait]
impl SelectionStrategy for RoundRobinStrategy {
  async fn pick(&self, candidates: &[GatewayInfo], _path: &str, _subdomain: &str) -> Option<String> {
    if candidates.is_empty() {
      return None;
    }
    let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
    Some(candidates[index].origin.clone())
  }
}

pub struct TemperatureStrategy {
  temperature: std::sync::Arc<TemperatureStore>,
}

impl TemperatureStrategy {
  pub fn new(temperature: std::sync::Arc<TemperatureStore>) -> Self {
    Self { temperature }
  }
}

#[async_trait::async_trait]
impl SelectionStrategy for TemperatureStrategy {
  async fn pick(&self, candidates: &[GatewayInfo], _path: &str, _subdomain: &str) -> Option<String> {
    let origins: Vec<String> = candidates.iter().map(|g| g.origin.clone()).collect();
    self.temperature.select_weighted(&origins)
  }
}

/// First responder to a cheap HEAD request wins, bounded by concurrency and
/// a 1s per-gateway timeout.
pub struct FastestStrategy {
  client: reqwest::Client,
  max_concurrency: usize,
}

impl FastestStrategy {
  pub fn new(client: reqwest::Client, max_concurrency: usize) -> Self {
    Self { client, max_concurrency }
  }
}

#[async_trait::async_trait]
impl SelectionStrategy for FastestStrategy {
  async fn pick(&self, candidates: &[GatewayInfo], _path: &str, _subdomain: &str) -> Option<String> {
    use futures_util::stream::{FuturesUnordered, StreamExt};

    if candidates.is_empty() {
      return None;
    }

    let mut pending = FuturesUnordered::new();
    for chunk in candidates.chunks(self.max_concurrency.max(1)) {
      for gateway in chunk {
        let client = self.client.clone();
        let origin = gateway.origin.clone();
        pending.push(async move {
          let result = tokio::time::timeout(
            Duration::from_secs(1),
            client.head(&origin).send(),
          )
          .await;
          match result {
            Ok(Ok(resp)) if resp.status().is_success() => Some(origin),
            _ => None,
          }
        });
      }

      while let Some(result) = pending.next().await {
        if let Some(origin) = result {
          return Some(origin);
        }
      }
    }

    None
  }
}

pub fn strategy_for(
  kind: RoutingStrategy,
  temperature: std::sync::Arc<TemperatureStore>,
  client: reqwest::Client,
  fastest_concurrency: usize,
) -> Box<dyn SelectionStrategy> {
  match kind {
    RoutingStrategy::Temperature => Box::new(TemperatureStrategy::new(temperature)),
    RoutingStrategy::Fastest => Box::new(FastestStrategy::new(client, fastest_concurrency)),
    RoutingStrategy::Random => Box::new(RandomStrategy),
    RoutingStrategy::RoundRobin => Box::new(RoundRobinStrategy::new()),
  }
}

pub struct Selector {
  health: std::sync::Arc<HealthRegistry>,
  strategy: Box<dyn SelectionStrategy>,
  retry_delay_ms: u64,
}

impl Selector {
  pub fn new(health: std::sync::Arc<HealthRegistry>, strategy: Box<dyn SelectionStrategy>, retry_delay_ms: u64) -> Self {
    Self { health, strategy, retry_delay_ms }
  }

  /// Filters `pool` by health and `excluded`, then asks the strategy to
  /// pick. If nothing survives, widens to unhealthy gateways, then to the
  /// full pool, with linear backoff between widenings.
  pub async fn select(
    &self,
    pool: &[GatewayInfo],
    excluded: &[String],
    path: &str,
    subdomain: &str,
  ) -> Option<String> {
    let not_excluded: Vec<GatewayInfo> = pool
      .iter()
      .filter(|g| !excluded.contains(&g.origin))
      .cloned()
      .collect();

    let healthy: Vec<GatewayInfo> = not_excluded
      .iter()
      .filter(|g| self.health.is_healthy(&g.origin))
      .cloned()
      .collect();

    if let Some(picked) = self.strategy.pick(&healthy, path, subdomain).await {
      return Some(picked);
    }

    tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
    if let Some(picked) = self.strategy.pick(&not_excluded, path, subdomain).await {
      return Some(picked);
    }

    tokio::time::sleep(Duration::from_millis(self.retry_delay_ms * 2)).await;
    self.strategy.pick(pool, path, subdomain).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::health::HealthRegistryConfig;

  fn gateway(origin: &str) -> GatewayInfo {
    GatewayInfo {
      origin: origin.to_string(),
      operator_stake: 0,
      delegated_stake: 0,
      total_stake: 0,
      hostname: origin.to_string(),
    }
  }

  #[tokio::test]
  async fn round_robin_cycles_through_candidates() {
    let strategy = RoundRobinStrategy::new();
    let pool = vec![gateway("g1"), gateway("g2")];
    let first = strategy.pick(&pool, "", "").await.unwrap();
    let second = strategy.pick(&pool, "", "").await.unwrap();
    assert_ne!(first, second);
  }

  #[tokio::test]
  async fn widens_to_full_pool_when_all_excluded() {
    let health = std::sync::Arc::new(HealthRegistry::new(HealthRegistryConfig::default()));
    let selector = Selector::new(health, Box::new(RoundRobinStrategy::new()), 1);
    let pool = vec![gateway("g1"), gateway("g2")];
    let picked = selector
      .select(&pool, &["g1".to_string(), "g2".to_string()], "/", "")
      .await;
    assert!(picked.is_some());
  }

  #[tokio::test]
  async fn excludes_unhealthy_before_widening() {
    let health = std::sync::Arc::new(HealthRegistry::new(HealthRegistryConfig {
      circuit_breaker_threshold: 1,
      ..HealthRegistryConfig::default()
    }));
    health.record_failure("g1", 1);
    let selector = Selector::new(health, Box::new(RoundRobinStrategy::new()), 1);
    let pool = vec![gateway("g1"), gateway("g2")];
    let picked = selector.select(&pool, &[], "/", "").await;
    assert_eq!(picked, Some("g2".to_string()));
  }
}
