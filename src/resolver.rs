//! Name resolver: ArNS name → txId via N-of-M consensus among trust anchors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::types::GatewayInfo;

#[derive(Debug, Clone)]
pub struct Resolution {
  pub tx_id: String,
  pub ttl_ms: u64,
}

/// Queries a single trust anchor for its view of an ArNS name.
#[async_trait::async_trait]
pub trait NameOracle: Send + Sync {
  async fn resolve(&self, anchor: &GatewayInfo, name: &str) -> anyhow::Result<Resolution>;
}

struct CacheEntry {
  tx_id: String,
  expires_at: Instant,
}

pub struct NameResolver {
  oracle: Arc<dyn NameOracle>,
  consensus_threshold: usize,
  default_ttl_ms: u64,
  resolution_timeout: Duration,
  cache: RwLock<HashMap<String, CacheEntry>>,
}

impl NameResolver {
  pub fn new(
    oracle: Arc<dyn NameOracle>,
    consensus_threshold: usize,
    default_ttl_ms: u64,
    resolution_timeout: Duration,
  ) -> Self {
    Self {
      oracle,
      consensus_threshold,
      default_ttl_ms,
      resolution_timeout,
      cache: RwLock::new(HashMap::new()),
    }
  }

  pub async fn resolve(&self, name: &str, anchors: &[GatewayInfo]) -> Result<String, GatewayError> {
    if let Some(tx_id) = self.cached(name).await {
      return Ok(tx_id);
    }

    let result = tokio::time::timeout(self.resolution_timeout, self.query_all(name, anchors)).await;

    let responses = match result {
      Ok(responses) => responses,
      Err(_) => {
        return Err(GatewayError::ResolutionTimeout {
          name: name.to_string(),
          responses: 0,
          required: self.consensus_threshold,
        })
      }
    };

    if responses.len() < self.consensus_threshold {
      return Err(GatewayError::ResolutionTimeout {
        name: name.to_string(),
        responses: responses.len(),
        required: self.consensus_threshold,
      });
    }

    let mut votes: HashMap<String, Vec<String>> = HashMap::new();
    for (anchor_origin, resolution) in &responses {
      votes.entry(resolution.tx_id.clone()).or_default().push(anchor_origin.clone());
    }

    let winner = votes.iter().max_by_key(|(_, v)| v.len());
    match winner {
      Some((tx_id, voters)) if voters.len() >= self.consensus_threshold => {
        let ttl_ms = responses
          .iter()
          .find(|(_, r)| &r.tx_id == tx_id)
          .map(|(_, r)| r.ttl_ms)
          .unwrap_or(self.default_ttl_ms);
        self.cache_insert(name, tx_id.clone(), ttl_ms).await;
        Ok(tx_id.clone())
      }
      _ => {
        let observed: String = responses
          .iter()
          .map(|(origin, r)| format!("{origin}->{}", r.tx_id))
          .collect::<Vec<_>>()
          .join(", ");
        Err(GatewayError::Consensus {
          name: name.to_string(),
          detail: observed,
        })
      }
    }
  }

  async fn query_all(&self, name: &str, anchors: &[GatewayInfo]) -> Vec<(String, Resolution)> {
    use futures_util::stream::{FuturesUnordered, StreamExt};

    let mut pending = FuturesUnordered::new();
    for anchor in anchors {
      let oracle = self.oracle.clone();
      let name = name.to_string();
      let origin = anchor.origin.clone();
      let anchor = anchor.clone();
      pending.push(async move { (origin, oracle.resolve(&anchor, &name).await) });
    }

    let mut responses = Vec::new();
    while let Some((origin, result)) = pending.next().await {
      if let Ok(resolution) = result {
        responses.push((origin, resolution));
      }
    }
    responses
  }

  async fn cached(&self, name: &str) -> Option<String> {
    let cache = self.cache.read().await;
    cache.get(name).and_then(|entry| {
      if entry.expires_at > Instant::now() {
        Some(entry.tx_id.clone())
      } else {
        None
      }
    })
  }

  async fn cache_insert(&self, name: &str, tx_id: String, ttl_ms: u64) {
    let mut cache = self.cache.write().await;
    cache.insert(
      name.to_string(),
      CacheEntry {
        tx_id,
        expires_at: Instant::now() + Duration::from_millis(ttl_ms),
      },
    );
  }

  /// Invalidates a cached resolution, used when a moderation event touches
  /// this name.
  pub async fn invalidate(&self, name: &str) {
    self.cache.write().await.remove(name);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct MapOracle {
    answers: HashMap<String, String>,
  }

  #[async_trait::async_trait]
  impl NameOracle for MapOracle {
    async fn resolve(&self, anchor: &GatewayInfo, _name: &str) -> anyhow::Result<Resolution> {
      let tx_id = self
        .answers
        .get(&anchor.origin)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no answer"))?;
      Ok(Resolution { tx_id, ttl_ms: 60_000 })
    }
  }

  fn anchor(origin: &str) -> GatewayInfo {
    GatewayInfo {
      origin: origin.to_string(),
      operator_stake: 0,
      delegated_stake: 0,
      total_stake: 0,
      hostname: origin.to_string(),
    }
  }

  #[tokio::test]
  async fn consensus_succeeds_when_threshold_agree() {
    let answers: HashMap<String, String> = [
      ("a1".to_string(), "AAA".to_string()),
      ("a2".to_string(), "AAA".to_string()),
      ("a3".to_string(), "AAA".to_string()),
    ]
    .into_iter()
    .collect();
    let resolver = NameResolver::new(
      Arc::new(MapOracle { answers }),
      3,
      60_000,
      Duration::from_secs(1),
    );
    let anchors = vec![anchor("a1"), anchor("a2"), anchor("a3")];
    let tx_id = resolver.resolve("x", &anchors).await.unwrap();
    assert_eq!(tx_id, "AAA");
  }

  #[tokio::test]
  async fn consensus_fails_on_disagreement() {
    let answers: HashMap<String, String> = [
      ("a1".to_string(), "AAA".to_string()),
      ("a2".to_string(), "AAA".to_string()),
      ("a3".to_string(), "BBB".to_string()),
    ]
    .into_iter()
    .collect();
    let resolver = NameResolver::new(
      Arc::new(MapOracle { answers }),
      3,
      60_000,
      Duration::from_secs(1),
    );
    let anchors = vec![anchor("a1"), anchor("a2"), anchor("a3")];
    let err = resolver.resolve("x", &anchors).await.unwrap_err();
    assert!(matches!(err, GatewayError::Consensus { .. }));
  }

  #[tokio::test]
  async fn second_request_is_served_from_cache() {
    let answers: HashMap<String, String> = [
      ("a1".to_string(), "AAA".to_string()),
      ("a2".to_string(), "AAA".to_string()),
    ]
    .into_iter()
    .collect();
    let resolver = NameResolver::new(
      Arc::new(MapOracle { answers }),
      2,
      60_000,
      Duration::from_secs(1),
    );
    let anchors = vec![anchor("a1"), anchor("a2")];
    resolver.resolve("x", &anchors).await.unwrap();

    // Remove the oracle's ability to answer by passing empty anchors; a
    // cache hit must still succeed.
    let tx_id = resolver.resolve("x", &[]).await.unwrap();
    assert_eq!(tx_id, "AAA");
  }
}
