//! Gateway-pool manager: periodic discovery, stake ordering, stale-on-failure
//! fallback.
//!
//! Concurrent callers share one in-flight discovery round rather than each
//! triggering their own; a refresh that fails or returns too few gateways
//! falls back to the last good cache, or a static fallback list if there is
//! no cache yet.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::types::GatewayInfo;

/// Discovers the live gateway registry. In production this wraps the
/// upstream name-system SDK; `HttpGatewayDiscovery` below is the concrete
/// implementation used by the running process, and tests inject a fake.
#[async_trait::async_trait]
pub trait GatewayDiscovery: Send + Sync {
  async fn discover(&self) -> anyhow::Result<Vec<GatewayInfo>>;
}

/// Fetches the registry as a JSON array of `GatewayInfo` records from a
/// configured endpoint, matching the shape the ar.io network SDK exposes.
pub struct HttpGatewayDiscovery {
  client: reqwest::Client,
  registry_url: String,
}

impl HttpGatewayDiscovery {
  pub fn new(client: reqwest::Client, registry_url: String) -> Self {
    Self { client, registry_url }
  }
}

#[async_trait::async_trait]
impl GatewayDiscovery for HttpGatewayDiscovery {
  async fn discover(&self) -> anyhow::Result<Vec<GatewayInfo>> {
    let response = self.client.get(&self.registry_url).send().await?;
    let gateways: Vec<GatewayInfo> = response.json().await?;
    Ok(gateways)
  }
}

struct CachedPool {
  gateways: Vec<GatewayInfo>,
  fetched_at: Instant,
  is_fallback: bool,
}

pub struct GatewayPoolConfig {
  pub refresh_interval: Duration,
  pub min_gateways: usize,
  pub fallback_gateways: Vec<String>,
}

pub struct GatewayPoolManager {
  discovery: Arc<dyn GatewayDiscovery>,
  config: GatewayPoolConfig,
  cache: AsyncMutex<Option<CachedPool>>,
  refresh_lock: AsyncMutex<()>,
}

impl GatewayPoolManager {
  pub fn new(discovery: Arc<dyn GatewayDiscovery>, config: GatewayPoolConfig) -> Self {
    Self {
      discovery,
      config,
      cache: AsyncMutex::new(None),
      refresh_lock: AsyncMutex::new(()),
    }
  }

  /// Stake-ordered list for routing: unrestricted, includes every discovered
  /// gateway.
  pub async fn get_all_gateways(&self) -> Vec<GatewayInfo> {
    self.ensure_fresh().await;
    self.cache.lock().await.as_ref().map(|c| c.gateways.clone()).unwrap_or_default()
  }

  /// Top-`n` by stake, used as the verification trust-anchor pool.
  pub async fn get_top_staked_gateways(&self, n: usize) -> Vec<GatewayInfo> {
    let all = self.get_all_gateways().await;
    all.into_iter().take(n).collect()
  }

  async fn ensure_fresh(&self) {
    let needs_refresh = {
      let cache = self.cache.lock().await;
      match cache.as_ref() {
        Some(entry) => entry.fetched_at.elapsed() >= self.refresh_window(),
        None => true,
      }
    };
    if needs_refresh {
      self.refresh().await;
    }
  }

  /// Fires slightly before the cache would otherwise expire, so a refresh
  /// is usually already in flight by the time callers would see stale data.
  fn refresh_window(&self) -> Duration {
    self.config.refresh_interval.mul_f64(0.95)
  }

  /// Concurrent callers share a single in-flight fetch.
  pub async fn refresh(&self) {
    let _permit = self.refresh_lock.lock().await;

    {
      let cache = self.cache.lock().await;
      if let Some(entry) = cache.as_ref() {
        if entry.fetched_at.elapsed() < self.refresh_window() {
          return; // someone else refreshed while we waited for the lock
        }
      }
    }

    match self.discovery.discover().await {
      Ok(mut gateways) => {
        gateways.retain(|g| !g.hostname.is_empty());
        gateways.sort_by(|a, b| b.total_stake.cmp(&a.total_stake));

        if gateways.len() < self.config.min_gateways {
          warn!(
            found = gateways.len(),
            required = self.config.min_gateways,
            "discovery returned fewer than minGateways; treating as a failed fetch"
          );
          self.fall_back_on_failure().await;
          return;
        }

        info!(count = gateways.len(), "gateway pool refreshed");
        let mut cache = self.cache.lock().await;
        *cache = Some(CachedPool {
          gateways,
          fetched_at: Instant::now(),
          is_fallback: false,
        });
      }
      Err(err) => {
        warn!(error = %err, "gateway discovery failed");
        self.fall_back_on_failure().await;
      }
    }
  }

  async fn fall_back_on_failure(&self) {
    let mut cache = self.cache.lock().await;
    if cache.is_some() {
      debug!("keeping stale gateway pool after failed refresh");
      return;
    }

    let fallback: Vec<GatewayInfo> = self
      .config
      .fallback_gateways
      .iter()
      .map(|origin| GatewayInfo {
        origin: origin.clone(),
        operator_stake: 0,
        delegated_stake: 0,
        total_stake: 0,
        hostname: origin
          .split("://")
          .nth(1)
          .unwrap_or(origin)
          .to_string(),
      })
      .collect();

    *cache = Some(CachedPool {
      gateways: fallback,
      fetched_at: Instant::now(),
      is_fallback: true,
    });
  }

  pub async fn is_fallback(&self) -> bool {
    self.cache.lock().await.as_ref().map(|c| c.is_fallback).unwrap_or(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FixedDiscovery {
    gateways: Vec<GatewayInfo>,
    calls: AtomicUsize,
    fail: bool,
  }

  #[async_trait::async_trait]
  impl GatewayDiscovery for FixedDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<GatewayInfo>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.fail {
        anyhow::bail!("discovery unavailable");
      }
      Ok(self.gateways.clone())
    }
  }

  fn gateway(origin: &str, stake: u64) -> GatewayInfo {
    GatewayInfo {
      origin: origin.to_string(),
      operator_stake: stake,
      delegated_stake: 0,
      total_stake: stake,
      hostname: origin.to_string(),
    }
  }

  #[tokio::test]
  async fn sorts_by_stake_descending() {
    let discovery = Arc::new(FixedDiscovery {
      gateways: vec![gateway("g1", 10), gateway("g2", 50), gateway("g3", 20)],
      calls: AtomicUsize::new(0),
      fail: false,
    });
    let manager = GatewayPoolManager::new(
      discovery,
      GatewayPoolConfig {
        refresh_interval: Duration::from_secs(60),
        min_gateways: 1,
        fallback_gateways: vec![],
      },
    );

    let all = manager.get_all_gateways().await;
    assert_eq!(all.iter().map(|g| g.origin.clone()).collect::<Vec<_>>(), vec!["g2", "g3", "g1"]);
  }

  #[tokio::test]
  async fn falls_back_to_static_list_on_failure_with_no_cache() {
    let discovery = Arc::new(FixedDiscovery {
      gateways: vec![],
      calls: AtomicUsize::new(0),
      fail: true,
    });
    let manager = GatewayPoolManager::new(
      discovery,
      GatewayPoolConfig {
        refresh_interval: Duration::from_secs(60),
        min_gateways: 1,
        fallback_gateways: vec!["https://fallback.example".to_string()],
      },
    );

    let all = manager.get_all_gateways().await;
    assert_eq!(all.len(), 1);
    assert!(manager.is_fallback().await);
  }

  #[tokio::test]
  async fn below_min_gateways_is_treated_as_failure() {
    let discovery = Arc::new(FixedDiscovery {
      gateways: vec![gateway("g1", 10)],
      calls: AtomicUsize::new(0),
      fail: false,
    });
    let manager = GatewayPoolManager::new(
      discovery,
      GatewayPoolConfig {
        refresh_interval: Duration::from_secs(60),
        min_gateways: 5,
        fallback_gateways: vec!["https://fallback.example".to_string()],
      },
    );

    let all = manager.get_all_gateways().await;
    assert_eq!(all.len(), 1);
    assert!(manager.is_fallback().await);
  }

  #[tokio::test]
  async fn top_staked_truncates() {
    let discovery = Arc::new(FixedDiscovery {
      gateways: vec![gateway("g1", 10), gateway("g2", 50), gateway("g3", 20)],
      calls: AtomicUsize::new(0),
      fail: false,
    });
    let manager = GatewayPoolManager::new(
      discovery,
      GatewayPoolConfig {
        refresh_interval: Duration::from_secs(60),
        min_gateways: 1,
        fallback_gateways: vec![],
      },
    );

    let top = manager.get_top_staked_gateways(2).await;
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].origin, "g2");
  }
}
