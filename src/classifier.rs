//! Request classifier: host/path → `RequestInfo`.

use std::sync::Arc;

use crate::blocklist::BlocklistStore;
use crate::sandbox;
use crate::types::{BlockedReason, RequestInfo};

const RESERVED_PREFIXES: &[&str] = &["/wayfinder"];
const API_ROUTES: &[&str] = &["/graphql", "/tx", "/info", "/peers", "/block", "/price"];

pub struct Classifier {
  base_domain: String,
  restrict_to_root_host: bool,
  blocklist: Arc<BlocklistStore>,
}

impl Classifier {
  pub fn new(base_domain: String, restrict_to_root_host: bool, blocklist: Arc<BlocklistStore>) -> Self {
    Self { base_domain, restrict_to_root_host, blocklist }
  }

  pub async fn classify(&self, host: &str, path: &str) -> RequestInfo {
    let host_only = host.split(':').next().unwrap_or(host);

    let subdomain = if host_only == self.base_domain {
      None
    } else {
      host_only
        .strip_suffix(&format!(".{}", self.base_domain))
        .map(|s| s.to_string())
    };

    if let Some(info) = self.classify_reserved_or_api(path) {
      return info;
    }

    if let Some(subdomain) = subdomain {
      return self.classify_subdomain(&subdomain, path).await;
    }

    if self.restrict_to_root_host {
      return RequestInfo::Blocked { reason: BlockedReason::RestrictionMode };
    }

    if let Some(info) = self.classify_root_host_tx_id(host_only, path) {
      return info;
    }

    RequestInfo::Reserved { path: path.to_string() }
  }

  fn classify_reserved_or_api(&self, path: &str) -> Option<RequestInfo> {
    if RESERVED_PREFIXES.iter().any(|p| path.starts_with(p)) {
      return Some(RequestInfo::Reserved { path: path.to_string() });
    }
    if let Some(category) = API_ROUTES.iter().find(|p| path.starts_with(**p)) {
      return Some(RequestInfo::Api {
        category: category.trim_start_matches('/').to_string(),
        params: path.to_string(),
      });
    }
    None
  }

  async fn classify_subdomain(&self, subdomain: &str, path: &str) -> RequestInfo {
    if sandbox::is_valid_sandbox(subdomain) {
      return self.classify_sandboxed_tx_id(subdomain, path).await;
    }

    if is_valid_arns_label(subdomain) {
      if self.blocklist.is_blocked_arns(subdomain).await {
        return RequestInfo::Blocked { reason: BlockedReason::ContentModerated };
      }
      return RequestInfo::Arns { name: subdomain.to_string(), path: path.to_string() };
    }

    RequestInfo::Blocked { reason: BlockedReason::SandboxMismatch }
  }

  async fn classify_sandboxed_tx_id(&self, subdomain: &str, path: &str) -> RequestInfo {
    let trimmed = path.trim_start_matches('/');
    let tx_id = &trimmed[..trimmed.len().min(sandbox::TXID_LEN)];

    if tx_id.len() != sandbox::TXID_LEN || !sandbox::is_valid_tx_id(tx_id) {
      return RequestInfo::Blocked { reason: BlockedReason::SandboxMismatch };
    }

    if !sandbox::sandbox_matches(subdomain, tx_id) {
      return RequestInfo::Blocked { reason: BlockedReason::SandboxMismatch };
    }

    if self.blocklist.is_blocked_txid(tx_id).await {
      return RequestInfo::Blocked { reason: BlockedReason::ContentModerated };
    }

    let subpath = &trimmed[tx_id.len()..];
    RequestInfo::TxId {
      id: tx_id.to_string(),
      path: subpath.to_string(),
      sandbox: subdomain.to_string(),
    }
  }

  fn classify_root_host_tx_id(&self, host_only: &str, path: &str) -> Option<RequestInfo> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.len() < sandbox::TXID_LEN {
      return None;
    }
    let tx_id = &trimmed[..sandbox::TXID_LEN];
    if !sandbox::is_valid_tx_id(tx_id) {
      return None;
    }

    let sandbox_label = sandbox::sandbox_for_tx_id(tx_id)?;
    let subpath = &trimmed[sandbox::TXID_LEN..];
    let location = format!("https://{sandbox_label}.{host_only}/{tx_id}{subpath}");
    Some(RequestInfo::RedirectToSandbox { location })
  }
}

fn is_valid_arns_label(label: &str) -> bool {
  (1..=51).contains(&label.len())
    && label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    && !sandbox::is_valid_tx_id(label)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    Classifier::new("example".to_string(), false, Arc::new(BlocklistStore::empty(None)))
  }

  #[tokio::test]
  async fn classifies_arns_subdomain() {
    let c = classifier();
    let info = c.classify("x.example", "/index.html").await;
    assert_eq!(info, RequestInfo::Arns { name: "x".to_string(), path: "/index.html".to_string() });
  }

  #[tokio::test]
  async fn classifies_sandboxed_tx_id() {
    let c = classifier();
    let tx_id = "A".repeat(43);
    let sandbox_label = sandbox::sandbox_for_tx_id(&tx_id).unwrap();
    let host = format!("{sandbox_label}.example");
    let path = format!("/{tx_id}/foo");
    let info = c.classify(&host, &path).await;
    assert_eq!(
      info,
      RequestInfo::TxId { id: tx_id, path: "/foo".to_string(), sandbox: sandbox_label }
    );
  }

  #[tokio::test]
  async fn rejects_sandbox_mismatch() {
    let c = classifier();
    let tx_id = "A".repeat(43);
    let wrong_tx_id = "B".repeat(43);
    let sandbox_label = sandbox::sandbox_for_tx_id(&wrong_tx_id).unwrap();
    let host = format!("{sandbox_label}.example");
    let path = format!("/{tx_id}/foo");
    let info = c.classify(&host, &path).await;
    assert_eq!(info, RequestInfo::Blocked { reason: BlockedReason::SandboxMismatch });
  }

  #[tokio::test]
  async fn redirects_bare_tx_id_to_sandbox() {
    let c = classifier();
    let tx_id = "A".repeat(43);
    let path = format!("/{tx_id}/foo");
    match c.classify("example", &path).await {
      RequestInfo::RedirectToSandbox { location } => {
        assert!(location.contains(&tx_id));
        assert!(location.starts_with("https://"));
      }
      other => panic!("expected redirect, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn restriction_mode_blocks_non_root_host() {
    let c = Classifier::new("example".to_string(), true, Arc::new(BlocklistStore::empty(None)));
    let info = c.classify("x.example", "/").await;
    assert_eq!(info, RequestInfo::Blocked { reason: BlockedReason::RestrictionMode });
  }

  #[tokio::test]
  async fn reserved_and_api_paths_take_priority() {
    let c = classifier();
    assert_eq!(
      c.classify("x.example", "/wayfinder/health").await,
      RequestInfo::Reserved { path: "/wayfinder/health".to_string() }
    );
    assert!(matches!(c.classify("x.example", "/graphql").await, RequestInfo::Api { .. }));
  }
}
