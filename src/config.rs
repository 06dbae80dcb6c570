//! Gateway configuration surface.
//!
//! Loaded once into an `Arc<Config>` and threaded through every component
//! constructor rather than read dynamically. Resolution order is a layered
//! search: explicit path → `GATEWAY_CONFIG` env → `./gateway.yml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub mode: ModeConfig,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub verification: VerificationConfig,
  #[serde(default)]
  pub network_gateways: NetworkGatewaysConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub resilience: ResilienceConfig,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub shutdown: ShutdownConfig,
  #[serde(default)]
  pub moderation: ModerationConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server: ServerConfig::default(),
      mode: ModeConfig::default(),
      routing: RoutingConfig::default(),
      verification: VerificationConfig::default(),
      network_gateways: NetworkGatewaysConfig::default(),
      cache: CacheConfig::default(),
      resilience: ResilienceConfig::default(),
      http: HttpConfig::default(),
      shutdown: ShutdownConfig::default(),
      moderation: ModerationConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
  pub port: u16,
  pub host: String,
  pub base_domain: String,
  pub root_host_content: Option<String>,
  pub restrict_to_root_host: bool,
  pub graphql_proxy_url: Option<String>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      port: 8080,
      host: "0.0.0.0".to_string(),
      base_domain: "localhost".to_string(),
      root_host_content: None,
      restrict_to_root_host: false,
      graphql_proxy_url: None,
    }
  }
}

impl ServerConfig {
  pub fn listen_addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultMode {
  Proxy,
  Route,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
  pub default: DefaultMode,
  pub allow_override: bool,
}

impl Default for ModeConfig {
  fn default() -> Self {
    Self {
      default: DefaultMode::Proxy,
      allow_override: false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
  Temperature,
  Fastest,
  Random,
  RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewaySource {
  Network,
  TrustedPeers,
  TrustedArio,
  Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
  pub strategy: RoutingStrategy,
  pub gateway_source: GatewaySource,
  pub retry_attempts: u32,
  pub retry_delay_ms: u64,
  pub temperature_window_ms: u64,
  pub temperature_max_samples: usize,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      strategy: RoutingStrategy::Temperature,
      gateway_source: GatewaySource::Network,
      retry_attempts: 3,
      retry_delay_ms: 250,
      temperature_window_ms: 5 * 60_000,
      temperature_max_samples: 64,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationGatewaySource {
  TopStaked,
  Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
  pub enabled: bool,
  pub gateway_source: VerificationGatewaySource,
  pub gateway_count: usize,
  pub consensus_threshold: usize,
  pub retry_attempts: u32,
  pub graphql_proxy_url: Option<String>,
}

impl Default for VerificationConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      gateway_source: VerificationGatewaySource::TopStaked,
      gateway_count: 3,
      consensus_threshold: 2,
      retry_attempts: 3,
      graphql_proxy_url: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkGatewaysConfig {
  pub refresh_interval_ms: u64,
  pub min_gateways: usize,
  pub fallback_gateways: Vec<String>,
}

impl Default for NetworkGatewaysConfig {
  fn default() -> Self {
    Self {
      refresh_interval_ms: 24 * 60 * 60 * 1000,
      min_gateways: 1,
      fallback_gateways: vec!["https://arweave.net".to_string()],
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  pub content_enabled: bool,
  pub content_max_size_bytes: u64,
  pub content_max_item_size_bytes: u64,
  pub content_path: Option<PathBuf>,
  pub arns_ttl_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      content_enabled: true,
      content_max_size_bytes: 512 * 1024 * 1024,
      content_max_item_size_bytes: 64 * 1024 * 1024,
      content_path: None,
      arns_ttl_ms: 5 * 60_000,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
  pub gateway_health_ttl_ms: u64,
  pub circuit_breaker_threshold: u32,
  pub circuit_breaker_reset_ms: u64,
  pub gateway_health_max_entries: usize,
  pub stream_timeout_ms: u64,
}

impl Default for ResilienceConfig {
  fn default() -> Self {
    Self {
      gateway_health_ttl_ms: 5 * 60_000,
      circuit_breaker_threshold: 3,
      circuit_breaker_reset_ms: 30_000,
      gateway_health_max_entries: 1000,
      stream_timeout_ms: 120_000,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
  pub connections_per_host: usize,
  pub connect_timeout_ms: u64,
  pub request_timeout_ms: u64,
  pub keep_alive_timeout_ms: u64,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      connections_per_host: 32,
      connect_timeout_ms: 30_000,
      request_timeout_ms: 30_000,
      keep_alive_timeout_ms: 90_000,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
  pub drain_timeout_ms: u64,
  pub shutdown_timeout_ms: u64,
}

impl Default for ShutdownConfig {
  fn default() -> Self {
    Self {
      drain_timeout_ms: 10_000,
      shutdown_timeout_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
  pub enabled: bool,
  pub blocklist_path: Option<PathBuf>,
  pub admin_token: Option<String>,
}

impl Default for ModerationConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      blocklist_path: None,
      admin_token: None,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },
  #[error("invalid configuration: {0}")]
  Invalid(String),
}

impl Config {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Single layered loader: explicit path → `GATEWAY_CONFIG` env →
  /// `./gateway.yml` → baked-in defaults.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = explicit_path {
      return Self::from_file(path);
    }

    if let Ok(env_path) = std::env::var("GATEWAY_CONFIG") {
      return Self::from_file(env_path);
    }

    let default_path = Path::new("gateway.yml");
    if default_path.exists() {
      return Self::from_file(default_path);
    }

    let config = Config::default();
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.verification.consensus_threshold < 2 {
      return Err(ConfigError::Invalid(
        "verification.consensusThreshold must be >= 2".to_string(),
      ));
    }
    if self.verification.consensus_threshold > self.verification.gateway_count {
      return Err(ConfigError::Invalid(
        "verification.consensusThreshold cannot exceed verification.gatewayCount".to_string(),
      ));
    }
    if self.network_gateways.min_gateways == 0 {
      return Err(ConfigError::Invalid(
        "networkGateways.minGateways must be >= 1".to_string(),
      ));
    }
    if self.cache.content_max_item_size_bytes > self.cache.content_max_size_bytes {
      return Err(ConfigError::Invalid(
        "cache.contentMaxItemSizeBytes cannot exceed cache.contentMaxSizeBytes".to_string(),
      ));
    }
    Ok(())
  }

  #[cfg(test)]
  pub fn for_testing() -> Self {
    let mut config = Config::default();
    config.network_gateways.fallback_gateways =
      vec!["https://g1.test".to_string(), "https://g2.test".to_string()];
    config.network_gateways.min_gateways = 1;
    config.verification.gateway_count = 2;
    config.verification.consensus_threshold = 2;
    config
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    assert!(Config::default().validate().is_ok());
  }

  #[test]
  fn rejects_consensus_threshold_below_two() {
    let mut config = Config::default();
    config.verification.consensus_threshold = 1;
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_consensus_threshold_above_gateway_count() {
    let mut config = Config::default();
    config.verification.gateway_count = 2;
    config.verification.consensus_threshold = 3;
    assert!(config.validate().is_err());
  }

  #[test]
  fn loads_from_yaml_file() {
    let config = Config::for_testing();
    let yaml = serde_yaml::to_string(&config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.yml");
    std::fs::write(&path, yaml).unwrap();

    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.verification.gateway_count, config.verification.gateway_count);
  }
}
