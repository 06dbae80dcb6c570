//! Verifying reverse proxy for a content-addressed gateway network: every
//! byte served is checked against a quorum of trust-anchor gateways before
//! it reaches a client.
//!
//! Wires together name resolution, gateway selection, fetch-and-verify, and
//! caching behind a single axum `Router`.

pub mod audit;
pub mod blocklist;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fetch;
pub mod gateway_client;
pub mod health;
pub mod lifecycle;
pub mod manifest;
pub mod pool;
pub mod resolver;
pub mod routes;
pub mod sandbox;
pub mod selector;
pub mod temperature;
pub mod types;
pub mod verifier;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};

use audit::{AuditConfig, GatewayAuditLogger};
use blocklist::BlocklistStore;
use cache::ContentCache;
use classifier::Classifier;
use fetch::FetchEngine;
use gateway_client::{HttpHashOracle, HttpManifestFetcher, HttpNameOracle, HttpUpstreamFetcher};
use health::{HealthRegistry, HealthRegistryConfig};
use lifecycle::Lifecycle;
use manifest::ManifestResolver;
use pool::{GatewayPoolConfig, GatewayPoolManager, HttpGatewayDiscovery};
use resolver::NameResolver;
use routes::AppState;
use selector::{strategy_for, Selector};
use temperature::{TemperatureConfig, TemperatureStore};
use verifier::Verifier;

/// A fully wired gateway process: every component instantiated from
/// `Config`, ready to `run()`.
pub struct Gateway {
  config: Arc<Config>,
  lifecycle: Arc<Lifecycle>,
  pool: Arc<GatewayPoolManager>,
  router: axum::Router,
}

impl Gateway {
  /// Builds every component and performs one blocking gateway-pool
  /// discovery round before returning, unless `skip_initial_discovery` is
  /// set (the CLI's `--skip-health-checks` escape hatch for development).
  pub async fn new(config: Config, skip_initial_discovery: bool) -> Result<Self> {
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    let http_client = reqwest::Client::builder()
      .connect_timeout(Duration::from_millis(config.http.connect_timeout_ms))
      .timeout(Duration::from_millis(config.http.request_timeout_ms))
      .pool_idle_timeout(Duration::from_millis(config.http.keep_alive_timeout_ms))
      .pool_max_idle_per_host(config.http.connections_per_host)
      .build()
      .context("failed to build HTTP client")?;

    let lifecycle = Lifecycle::new();
    let audit = Arc::new(GatewayAuditLogger::new(AuditConfig::default()));

    let blocklist = Arc::new(BlocklistStore::load(config.moderation.blocklist_path.clone()).await);
    let classifier = Arc::new(Classifier::new(
      config.server.base_domain.clone(),
      config.server.restrict_to_root_host,
      blocklist.clone(),
    ));

    let registry_url = discovery_url(&config);
    let discovery = Arc::new(HttpGatewayDiscovery::new(http_client.clone(), registry_url));
    let pool = Arc::new(GatewayPoolManager::new(
      discovery,
      GatewayPoolConfig {
        refresh_interval: Duration::from_millis(config.network_gateways.refresh_interval_ms),
        min_gateways: config.network_gateways.min_gateways,
        fallback_gateways: config.network_gateways.fallback_gateways.clone(),
      },
    ));
    if !skip_initial_discovery {
      pool.refresh().await;
    }
    lifecycle.spawn_periodic("gateway-pool-refresh", Duration::from_millis(config.network_gateways.refresh_interval_ms), {
      let pool = pool.clone();
      move || {
        let pool = pool.clone();
        async move { pool.refresh().await }
      }
    });

    let health = Arc::new(HealthRegistry::new(HealthRegistryConfig {
      health_ttl_ms: config.resilience.gateway_health_ttl_ms,
      circuit_breaker_threshold: config.resilience.circuit_breaker_threshold,
      circuit_breaker_reset_ms: config.resilience.circuit_breaker_reset_ms,
      max_entries: config.resilience.gateway_health_max_entries,
    }));

    let temperature = Arc::new(TemperatureStore::new(TemperatureConfig {
      window_ms: config.routing.temperature_window_ms,
      max_samples: config.routing.temperature_max_samples,
    }));

    let strategy = strategy_for(config.routing.strategy, temperature.clone(), http_client.clone(), config.http.connections_per_host);
    let selector = Arc::new(Selector::new(health.clone(), strategy, config.routing.retry_delay_ms));

    let hash_oracle: Arc<dyn verifier::HashOracle> = Arc::new(HttpHashOracle::new(http_client.clone()));
    let verifier = Arc::new(Verifier::new(hash_oracle.clone(), config.verification.consensus_threshold));

    let name_oracle: Arc<dyn resolver::NameOracle> = Arc::new(HttpNameOracle::new(http_client.clone()));
    let resolver = Arc::new(NameResolver::new(
      name_oracle,
      config.verification.consensus_threshold,
      config.cache.arns_ttl_ms,
      Duration::from_millis(config.http.request_timeout_ms),
    ));

    let manifest_fetcher: Arc<dyn manifest::ManifestFetcher> = Arc::new(HttpManifestFetcher::new(
      http_client.clone(),
      pool.clone(),
      hash_oracle,
      config.verification.gateway_count,
    ));
    let manifest_resolver = Arc::new(ManifestResolver::new(manifest_fetcher));

    let content_cache = Arc::new(
      ContentCache::new(
        config.cache.content_path.clone(),
        config.cache.content_max_size_bytes,
        config.cache.content_max_item_size_bytes,
      )
      .await,
    );
    let api_cache = Arc::new(ContentCache::new(None, config.cache.content_max_size_bytes, config.cache.content_max_item_size_bytes).await);

    let upstream: Arc<dyn fetch::UpstreamFetcher> = Arc::new(HttpUpstreamFetcher::new(http_client.clone()));
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

    let state = AppState::new(
      config.clone(),
      classifier,
      resolver,
      pool.clone(),
      fetch_engine,
      blocklist,
      lifecycle.clone(),
      api_cache,
      audit,
      http_client,
    );

    Ok(Self {
      config,
      lifecycle,
      pool,
      router: routes::router(state),
    })
  }

  pub fn listen_addr(&self) -> String {
    self.config.server.listen_addr()
  }

  pub async fn gateway_pool_size(&self) -> usize {
    self.pool.get_all_gateways().await.len()
  }

  /// Binds and serves until a shutdown signal arrives, then drains
  /// in-flight requests before returning.
  pub async fn run(self) -> Result<()> {
    let addr = self.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind listener")?;
    info!(address = %addr, "gateway listening");

    let drain_timeout = Duration::from_millis(self.config.shutdown.drain_timeout_ms);
    let lifecycle = self.lifecycle.clone();

    let server = axum::serve(listener, self.router).with_graceful_shutdown(async move {
      tokio::signal::ctrl_c().await.ok();
      info!("shutdown signal received");
    });

    server.await.context("server error")?;
    lifecycle.shutdown(drain_timeout).await;
    Ok(())
  }
}

/// Registry endpoint for gateway discovery: the first configured fallback
/// gateway's `ar-io` gateway-list endpoint, matching the shape returned by
/// a running ar.io node's peer registry.
fn discovery_url(config: &Config) -> String {
  let origin = config
    .network_gateways
    .fallback_gateways
    .first()
    .cloned()
    .unwrap_or_else(|| "https://arweave.net".to_string());
  format!("{origin}/ar-io/resolver/gateways")
}
