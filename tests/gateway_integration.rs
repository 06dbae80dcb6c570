//! End-to-end coverage of the verified-content pipeline: real HTTP requests
//! driven through the fully-wired router, production adapters
//! (`gateway_client.rs`) talking to `wiremock`-backed gateways instead of
//! the in-process fakes the unit tests use.
//!
//! Each test builds the real service, sends a real request, and asserts on
//! the response.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use bytes::Bytes;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wayfinder_gateway::audit::{AuditConfig, GatewayAuditLogger};
use wayfinder_gateway::blocklist::BlocklistStore;
use wayfinder_gateway::cache::ContentCache;
use wayfinder_gateway::classifier::Classifier;
use wayfinder_gateway::config::{Config, RoutingStrategy};
use wayfinder_gateway::fetch::{FetchEngine, UpstreamFetcher};
use wayfinder_gateway::gateway_client::{HttpHashOracle, HttpManifestFetcher, HttpNameOracle, HttpUpstreamFetcher};
use wayfinder_gateway::health::{HealthRegistry, HealthRegistryConfig};
use wayfinder_gateway::lifecycle::Lifecycle;
use wayfinder_gateway::manifest::ManifestResolver;
use wayfinder_gateway::pool::{GatewayDiscovery, GatewayPoolConfig, GatewayPoolManager};
use wayfinder_gateway::resolver::NameResolver;
use wayfinder_gateway::routes::{self, AppState};
use wayfinder_gateway::selector::{strategy_for, Selector};
use wayfinder_gateway::temperature::{TemperatureConfig, TemperatureStore};
use wayfinder_gateway::types::GatewayInfo;
use wayfinder_gateway::verifier::Verifier;

/// Hands back whatever fixed gateway list the test built, bypassing the
/// real ar.io registry call.
struct StaticDiscovery(Vec<GatewayInfo>);

#[async_trait::async_trait]
impl GatewayDiscovery for StaticDiscovery {
  async fn discover(&self) -> anyhow::Result<Vec<GatewayInfo>> {
    Ok(self.0.clone())
  }
}

struct Harness {
  router: axum::Router,
  lifecycle: Arc<Lifecycle>,
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

/// Wires every production component the way `Gateway::new` does, against a
/// test-controlled gateway list instead of a real registry.
async fn build(mut config: Config, gateways: Vec<GatewayInfo>) -> Harness {
  config.routing.strategy = RoutingStrategy::RoundRobin;
  let config = Arc::new(config);
  let client = reqwest::Client::new();

  let discovery: Arc<dyn GatewayDiscovery> = Arc::new(StaticDiscovery(gateways));
  let pool = Arc::new(GatewayPoolManager::new(
    discovery,
    GatewayPoolConfig {
      refresh_interval: Duration::from_secs(3600),
      min_gateways: 1,
      fallback_gateways: vec![],
    },
  ));
  pool.refresh().await;

  let health = Arc::new(HealthRegistry::new(HealthRegistryConfig::default()));
  let temperature = Arc::new(TemperatureStore::new(TemperatureConfig::default()));
  let strategy = strategy_for(RoutingStrategy::RoundRobin, temperature.clone(), client.clone(), 4);
  let selector = Arc::new(Selector::new(health.clone(), strategy, 1));

  let hash_oracle: Arc<dyn wayfinder_gateway::verifier::HashOracle> = Arc::new(HttpHashOracle::new(client.clone()));
  let verifier = Arc::new(Verifier::new(hash_oracle.clone(), config.verification.consensus_threshold));

  let name_oracle: Arc<dyn wayfinder_gateway::resolver::NameOracle> = Arc::new(HttpNameOracle::new(client.clone()));
  let resolver = Arc::new(NameResolver::new(
    name_oracle,
    config.verification.consensus_threshold,
    config.cache.arns_ttl_ms,
    Duration::from_secs(5),
  ));

  let manifest_fetcher: Arc<dyn wayfinder_gateway::manifest::ManifestFetcher> = Arc::new(HttpManifestFetcher::new(
    client.clone(),
    pool.clone(),
    hash_oracle,
    config.verification.gateway_count,
  ));
  let manifest_resolver = Arc::new(ManifestResolver::new(manifest_fetcher));

  let content_cache = Arc::new(ContentCache::new(None, 64 * 1024 * 1024, 16 * 1024 * 1024).await);
  let api_cache = Arc::new(ContentCache::new(None, 64 * 1024 * 1024, 16 * 1024 * 1024).await);

  let upstream: Arc<dyn UpstreamFetcher> = Arc::new(HttpUpstreamFetcher::new(client.clone()));
  let fetch_engine = Arc::new(FetchEngine::new(
    selector,
    health,
    temperature,
    content_cache,
    manifest_resolver,
    verifier,
    upstream,
    config.verification.retry_attempts,
  ));

  let blocklist = Arc::new(BlocklistStore::empty(None));
  let classifier = Arc::new(Classifier::new(
    config.server.base_domain.clone(),
    config.server.restrict_to_root_host,
    blocklist.clone(),
  ));
  let lifecycle = Lifecycle::new();
  let audit = Arc::new(GatewayAuditLogger::new(AuditConfig::default()));

  let state = AppState::new(
    config.clone(),
    classifier,
    resolver,
    pool,
    fetch_engine,
    blocklist,
    lifecycle.clone(),
    api_cache,
    audit,
    client,
  );

  Harness { router: routes::router(state), lifecycle }
}

fn base_config() -> Config {
  let mut config = Config::default();
  config.server.base_domain = "gateway.test".to_string();
  config
}

async fn get(router: &axum::Router, host: &str, uri: &str) -> (StatusCode, axum::http::HeaderMap, Bytes) {
  let request = Request::builder()
    .method("GET")
    .uri(uri)
    .header(header::HOST, host)
    .body(Body::empty())
    .unwrap();
  let response = router.clone().oneshot(request).await.unwrap();
  let status = response.status();
  let headers = response.headers().clone();
  let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
  (status, headers, body)
}

fn header_str<'a>(headers: &'a axum::http::HeaderMap, name: &str) -> Option<&'a str> {
  headers.get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn healthy_fetch_is_verified_and_served() {
  let gw_a = MockServer::start().await;
  let gw_b = MockServer::start().await;

  for gw in [&gw_a, &gw_b] {
    Mock::given(method("GET"))
      .and(path("/ar-io/resolver/records/myapp"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"txId": "TX1.DATA", "ttlSeconds": 60})))
      .mount(gw)
      .await;
    // `HttpUpstreamFetcher` appends the request path ("/") after the txId;
    // `HttpHashOracle` confirms against the bare txId with no trailing
    // slash. Both must serve the same body.
    for content_path in ["/TX1.DATA/", "/TX1.DATA"] {
      Mock::given(method("GET"))
        .and(path(content_path))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello world").insert_header("content-type", "text/plain"))
        .mount(gw)
        .await;
    }
  }

  let mut config = base_config();
  config.verification.gateway_count = 2;
  config.verification.consensus_threshold = 2;

  let gateways = vec![gateway(&gw_a.uri(), 20), gateway(&gw_b.uri(), 10)];
  let harness = build(config, gateways).await;

  let (status, headers, body) = get(&harness.router, "myapp.gateway.test", "/").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(&body[..], b"hello world");
  assert_eq!(header_str(&headers, "x-wayfinder-verified"), Some("true"));
  assert_eq!(header_str(&headers, "x-wayfinder-tx-id"), Some("TX1.DATA"));
  assert_eq!(header_str(&headers, "x-wayfinder-cached"), Some("false"));
}

#[tokio::test]
async fn verification_fault_on_first_gateway_triggers_retry() {
  let bad = MockServer::start().await;
  let good_1 = MockServer::start().await;
  let good_2 = MockServer::start().await;

  for gw in [&bad, &good_1, &good_2] {
    Mock::given(method("GET"))
      .and(path("/ar-io/resolver/records/myapp2"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"txId": "TX2.DATA", "ttlSeconds": 60})))
      .mount(gw)
      .await;
  }
  for content_path in ["/TX2.DATA/", "/TX2.DATA"] {
    Mock::given(method("GET"))
      .and(path(content_path))
      .respond_with(ResponseTemplate::new(200).set_body_string("wrong content").insert_header("content-type", "text/plain"))
      .mount(&bad)
      .await;
  }
  for gw in [&good_1, &good_2] {
    for content_path in ["/TX2.DATA/", "/TX2.DATA"] {
      Mock::given(method("GET"))
        .and(path(content_path))
        .respond_with(ResponseTemplate::new(200).set_body_string("good content").insert_header("content-type", "text/plain"))
        .mount(gw)
        .await;
    }
  }

  let mut config = base_config();
  config.verification.gateway_count = 3;
  config.verification.consensus_threshold = 2;
  config.verification.retry_attempts = 3;

  // Highest stake first so the round-robin strategy's first pick lands on
  // the misbehaving gateway.
  let gateways = vec![gateway(&bad.uri(), 30), gateway(&good_1.uri(), 20), gateway(&good_2.uri(), 10)];
  let harness = build(config, gateways).await;

  let (status, headers, body) = get(&harness.router, "myapp2.gateway.test", "/").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(&body[..], b"good content");
  assert_eq!(header_str(&headers, "x-wayfinder-verified"), Some("true"));
  let routed_via = header_str(&headers, "x-wayfinder-routed-via").unwrap();
  assert_ne!(routed_via, bad.uri());
}

#[tokio::test]
async fn arns_consensus_failure_returns_bad_gateway() {
  let a1 = MockServer::start().await;
  let a2 = MockServer::start().await;
  let a3 = MockServer::start().await;

  for (gw, tx_id) in [(&a1, "TXAAA"), (&a2, "TXBBB"), (&a3, "TXCCC")] {
    Mock::given(method("GET"))
      .and(path("/ar-io/resolver/records/disputed"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"txId": tx_id, "ttlSeconds": 60})))
      .mount(gw)
      .await;
  }

  let mut config = base_config();
  config.verification.gateway_count = 3;
  config.verification.consensus_threshold = 2;

  let gateways = vec![gateway(&a1.uri(), 30), gateway(&a2.uri(), 20), gateway(&a3.uri(), 10)];
  let harness = build(config, gateways).await;

  let (status, _headers, body) = get(&harness.router, "disputed.gateway.test", "/").await;
  assert_eq!(status, StatusCode::BAD_GATEWAY);
  let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(parsed["error"], "consensus_error");
}

#[tokio::test]
async fn manifest_without_matching_path_serves_fallback_entry() {
  let gw1 = MockServer::start().await;
  let gw2 = MockServer::start().await;

  let manifest_json = serde_json::to_vec(&serde_json::json!({
    "paths": {"index.html": {"id": "X".repeat(43)}},
    "index": {"path": "index.html"},
    "fallback": {"id": "fallback.bin"},
  }))
  .unwrap();

  for gw in [&gw1, &gw2] {
    Mock::given(method("GET"))
      .and(path("/ar-io/resolver/records/docs"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"txId": "M.MANIFEST", "ttlSeconds": 60})))
      .mount(gw)
      .await;
    // The initial content probe: same origin, full requested path appended,
    // only the manifest content-type matters here (fetch.rs's `try_gateway`
    // branches on it, the body is discarded).
    Mock::given(method("GET"))
      .and(path("/M.MANIFEST/notfound.css"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::new()).insert_header("content-type", "application/x.arweave-manifest+json"))
      .mount(gw)
      .await;
    // The manifest document itself: fetched with no subpath by
    // `HttpManifestFetcher`, and hashed from this same body by
    // `HttpHashOracle` for anchor confirmation.
    Mock::given(method("GET"))
      .and(path("/M.MANIFEST"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest_json.clone()))
      .mount(gw)
      .await;
    Mock::given(method("GET"))
      .and(path("/fallback.bin"))
      .respond_with(ResponseTemplate::new(200).set_body_string("fallback body").insert_header("content-type", "text/plain"))
      .mount(gw)
      .await;
  }

  let mut config = base_config();
  config.verification.gateway_count = 2;
  config.verification.consensus_threshold = 2;

  let gateways = vec![gateway(&gw1.uri(), 20), gateway(&gw2.uri(), 10)];
  let harness = build(config, gateways).await;

  let (status, headers, body) = get(&harness.router, "docs.gateway.test", "/notfound.css").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(&body[..], b"fallback body");
  assert_eq!(header_str(&headers, "x-wayfinder-manifest-tx-id"), Some("M.MANIFEST"));
  assert_eq!(header_str(&headers, "x-wayfinder-verified"), Some("true"));
}

#[tokio::test]
async fn bare_tx_id_on_root_host_redirects_to_sandbox() {
  let config = base_config();
  let harness = build(config, vec![]).await;

  let tx_id = "A".repeat(43);
  let (status, headers, _body) = get(&harness.router, "gateway.test", &format!("/{tx_id}/index.html")).await;

  assert_eq!(status, StatusCode::FOUND);
  let location = header_str(&headers, "location").unwrap();
  assert!(location.starts_with("https://"));
  assert!(location.contains(&tx_id));
  assert!(location.contains("gateway.test"));
}

#[tokio::test]
async fn draining_server_rejects_new_requests() {
  let config = base_config();
  let harness = build(config, vec![]).await;

  let drained = harness.lifecycle.shutdown(Duration::from_millis(100)).await;
  assert!(drained); // nothing in flight yet, so drain completes immediately

  let (status, _headers, body) = get(&harness.router, "gateway.test", "/wayfinder/health").await;
  assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
  assert_eq!(&body[..], b"server is draining");
}
