//! Shared data-model types that cross component boundaries.
//!
//! Kept deliberately dumb: plain structs with `serde` derives only where the
//! value actually crosses a persistence or wire boundary (blocklist file,
//! cache meta JSON).

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A gateway's normalized origin (`scheme://host[:port]`), used as the key
/// into every per-gateway registry (health, temperature, pool entries).
pub type Origin = String;

/// Entry in the discovered gateway pool, sorted by `total_stake` descending
/// (stable under ties) by the pool manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayInfo {
  pub origin: Origin,
  pub operator_stake: u64,
  pub delegated_stake: u64,
  pub total_stake: u64,
  pub hostname: String,
}

impl GatewayInfo {
  pub fn combined_stake(&self) -> u64 {
    self.operator_stake + self.delegated_stake
  }
}

/// Per-gateway circuit-breaker state tracked by the health registry.
#[derive(Debug, Clone)]
pub struct GatewayHealth {
  pub healthy: bool,
  pub last_checked: Instant,
  pub failures: u32,
  pub circuit_open: bool,
  pub circuit_open_until: Option<Instant>,
}

impl GatewayHealth {
  pub fn fresh() -> Self {
    Self {
      healthy: true,
      last_checked: Instant::now(),
      failures: 0,
      circuit_open: false,
      circuit_open_until: None,
    }
  }
}

/// One observation in a gateway's rolling temperature window.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureSample {
  pub timestamp_ms: u64,
  pub latency_ms: u32,
  pub success: bool,
}

/// An object held by the content cache, either fully in memory or as an
/// index entry pointing at a disk-backed blob (`data` then empty).
#[derive(Debug, Clone)]
pub struct CachedContent {
  pub data: bytes::Bytes,
  pub content_type: Option<String>,
  pub content_length: usize,
  pub headers: Vec<(String, String)>,
  pub verified_at: std::time::SystemTime,
  pub tx_id: String,
  pub hash: Option<String>,
  pub access_count: u64,
  pub last_accessed: std::time::SystemTime,
}

/// On-disk sidecar for a disk-backed cache entry; mirrors `CachedContent`
/// minus the bytes themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
  pub key: String,
  pub content_type: Option<String>,
  pub content_length: usize,
  pub headers: Vec<(String, String)>,
  pub verified_at_unix_ms: u64,
  pub tx_id: String,
  pub hash: Option<String>,
}

/// A path manifest resolved and independently verified by the manifest
/// resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDoc {
  #[serde(default)]
  pub paths: std::collections::HashMap<String, ManifestPathEntry>,
  #[serde(default)]
  pub index: Option<ManifestIndex>,
  #[serde(default)]
  pub fallback: Option<ManifestPathEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestPathEntry {
  pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestIndex {
  pub path: String,
}

#[derive(Debug, Clone)]
pub struct VerifiedManifest {
  pub tx_id: String,
  pub manifest: ManifestDoc,
  pub verified_at: std::time::SystemTime,
  pub size_bytes: usize,
}

impl VerifiedManifest {
  pub fn is_valid_shape(doc: &ManifestDoc) -> bool {
    !doc.paths.is_empty() || doc.index.is_some()
  }
}

/// Outcome of resolving a subpath through a manifest.
pub struct ResolvedManifestPath {
  pub tx_id: String,
  pub is_index: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlocklistEntryType {
  Arns,
  Txid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistEntry {
  #[serde(rename = "type")]
  pub entry_type: BlocklistEntryType,
  pub value: String,
  pub reason: String,
  pub blocked_at: chrono::DateTime<chrono::Utc>,
  pub blocked_by: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_tx_id: Option<String>,
}

/// Versioned on-disk shape of the blocklist file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistFile {
  pub version: u32,
  pub updated_at: chrono::DateTime<chrono::Utc>,
  pub entries: Vec<BlocklistEntry>,
}

/// Result of classifying an inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestInfo {
  Arns {
    name: String,
    path: String,
  },
  TxId {
    id: String,
    path: String,
    sandbox: String,
  },
  Api {
    category: String,
    params: String,
  },
  Reserved {
    path: String,
  },
  Blocked {
    reason: BlockedReason,
  },
  /// A bare `baseDomain/<txId>...` request, which must 302 to the sandbox
  /// subdomain before anything is served.
  RedirectToSandbox {
    location: String,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
  SandboxMismatch,
  RestrictionMode,
  ContentModerated,
}

impl BlockedReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      BlockedReason::SandboxMismatch => "sandbox_mismatch",
      BlockedReason::RestrictionMode => "restriction_mode",
      BlockedReason::ContentModerated => "content_moderated",
    }
  }
}

/// Proxy delivery mode, settable per-route and overridable per-request when
/// `mode.allowOverride` is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
  Proxy,
  Route,
}

/// Result of a successful verified fetch, carried through to the response
/// builder for provenance headers.
#[derive(Debug, Clone)]
pub struct VerifiedFetch {
  pub content: CachedContent,
  pub routed_via: String,
  pub verified: bool,
  pub verified_by: Vec<String>,
  pub cached: bool,
  pub cache_age_secs: Option<u64>,
  pub manifest_tx_id: Option<String>,
  pub verification_time_ms: Option<u64>,
}
