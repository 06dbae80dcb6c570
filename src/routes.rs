//! HTTP surface: the verified-content pipeline plus the administrative and
//! proxied-API routes around it.
//!
//! `/health`, `/health/live`, and `/health/ready` report process and
//! gateway-pool status; `/graphql`, `/info`, `/tx`, `/block`, `/peers`, and
//! `/price` are forwarded unverified to the current gateway pool, distinct
//! from the verified-content path the rest of this module drives.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use axum::body::{Body, Bytes};
use axum::extract::{Host, OriginalUri, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::audit::GatewayAuditLogger;
use crate::blocklist::BlocklistStore;
use crate::cache::ContentCache;
use crate::classifier::Classifier;
use crate::config::{Config, DefaultMode};
use crate::error::GatewayError;
use crate::fetch::{provenance_headers, FetchEngine};
use crate::gateway_client::upstream_url;
use crate::lifecycle::Lifecycle;
use crate::pool::GatewayPoolManager;
use crate::resolver::NameResolver;
use crate::types::{
  BlockedReason, BlocklistEntry, BlocklistEntryType, CachedContent, DeliveryMode, RequestInfo, VerifiedFetch,
};

const MODE_HEADER: &str = "x-wayfinder-mode";
const READY_MIN_UPTIME_SECS: u64 = 5;

/// Hop-by-hop headers stripped before forwarding a response body to the
/// client or a request body upstream (RFC 7230 §6.1, plus `content-length`
/// since axum/reqwest recompute it from the body we set).
const STRIPPED_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailers",
  "transfer-encoding",
  "upgrade",
  "content-length",
  "host",
];

struct Inner {
  config: Arc<Config>,
  classifier: Arc<Classifier>,
  resolver: Arc<NameResolver>,
  pool: Arc<GatewayPoolManager>,
  fetch_engine: Arc<FetchEngine>,
  blocklist: Arc<BlocklistStore>,
  lifecycle: Arc<Lifecycle>,
  api_cache: Arc<ContentCache>,
  audit: Arc<GatewayAuditLogger>,
  http_client: reqwest::Client,
  started_at: Instant,
}

#[derive(Clone)]
pub struct AppState(Arc<Inner>);

impl AppState {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    config: Arc<Config>,
    classifier: Arc<Classifier>,
    resolver: Arc<NameResolver>,
    pool: Arc<GatewayPoolManager>,
    fetch_engine: Arc<FetchEngine>,
    blocklist: Arc<BlocklistStore>,
    lifecycle: Arc<Lifecycle>,
    api_cache: Arc<ContentCache>,
    audit: Arc<GatewayAuditLogger>,
    http_client: reqwest::Client,
  ) -> Self {
    Self(Arc::new(Inner {
      config,
      classifier,
      resolver,
      pool,
      fetch_engine,
      blocklist,
      lifecycle,
      api_cache,
      audit,
      http_client,
      started_at: Instant::now(),
    }))
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/wayfinder/health", get(health))
    .route("/wayfinder/ready", get(ready))
    .route("/wayfinder/metrics", get(metrics))
    .route("/wayfinder/stats/summary", get(stats_summary))
    .route("/wayfinder/moderation/block", post(moderation_block))
    .route("/wayfinder/moderation/unblock", post(moderation_unblock))
    .route("/wayfinder/moderation/list", get(moderation_list))
    .route("/graphql", any(graphql_proxy))
    .route("/info", any(api_proxy))
    .route("/tx/{*rest}", any(api_proxy))
    .route("/block/{*rest}", any(api_proxy))
    .route("/peers", any(api_proxy))
    .route("/price/{*rest}", any(api_proxy))
    .fallback(content)
    .layer(middleware::from_fn_with_state(state.clone(), drain_gate))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(state)
}

async fn drain_gate(State(state): State<AppState>, req: axum::extract::Request, next: Next) -> Response {
  let Some(_guard) = state.0.lifecycle.begin_request() else {
    return (StatusCode::SERVICE_UNAVAILABLE, "server is draining").into_response();
  };
  next.run(req).await
}

// ---------------------------------------------------------------------------
// Verified content pipeline
// ---------------------------------------------------------------------------

async fn content(State(state): State<AppState>, Host(host): Host, uri: OriginalUri, headers: HeaderMap) -> Response {
  let path = uri.0.path();
  let info = state.0.classifier.classify(&host, path).await;

  match info {
    RequestInfo::RedirectToSandbox { location } => redirect_found(&location),
    RequestInfo::Blocked { reason } => {
      if reason == BlockedReason::ContentModerated {
        state
          .0
          .audit
          .log_content_blocked(uuid::Uuid::new_v4().to_string(), None, reason.as_str().to_string())
          .await;
      }
      blocked_response(reason)
    }
    RequestInfo::Reserved { .. } | RequestInfo::Api { .. } => StatusCode::NOT_FOUND.into_response(),
    RequestInfo::Arns { name, path } => {
      let anchors = state.0.pool.get_top_staked_gateways(state.0.config.verification.gateway_count).await;
      match state.0.resolver.resolve(&name, &anchors).await {
        Ok(tx_id) => serve_content(&state, &tx_id, &path, &headers).await,
        Err(err) => err.into_response(),
      }
    }
    RequestInfo::TxId { id, path, .. } => serve_content(&state, &id, &path, &headers).await,
  }
}

fn resolve_mode(config: &Config, headers: &HeaderMap) -> DeliveryMode {
  if config.mode.allow_override {
    if let Some(requested) = headers.get(MODE_HEADER).and_then(|v| v.to_str().ok()) {
      match requested {
        "proxy" => return DeliveryMode::Proxy,
        "route" => return DeliveryMode::Route,
        _ => {}
      }
    }
  }
  match config.mode.default {
    DefaultMode::Proxy => DeliveryMode::Proxy,
    DefaultMode::Route => DeliveryMode::Route,
  }
}

async fn serve_content(state: &AppState, tx_id: &str, path: &str, headers: &HeaderMap) -> Response {
  let request_id = uuid::Uuid::new_v4().to_string();
  let started = Instant::now();

  let pool = state.0.pool.get_all_gateways().await;
  let anchors = state.0.pool.get_top_staked_gateways(state.0.config.verification.gateway_count).await;

  let result = match state.0.fetch_engine.fetch_and_verify(tx_id, path, &pool, &anchors).await {
    Ok(result) => result,
    Err(err) => {
      state
        .0
        .audit
        .log_request_completed(
          request_id,
          "GET".to_string(),
          path.to_string(),
          err.status_code().as_u16(),
          started.elapsed(),
          Some(tx_id.to_string()),
          None,
          false,
          false,
        )
        .await;
      return err.into_response();
    }
  };

  state
    .0
    .audit
    .log_request_completed(
      request_id,
      "GET".to_string(),
      path.to_string(),
      StatusCode::OK.as_u16(),
      started.elapsed(),
      Some(tx_id.to_string()),
      Some(result.routed_via.clone()),
      result.verified,
      result.cached,
    )
    .await;

  // Route-mode overrides keep the consensus/verification step above but
  // redirect instead of proxying the body.
  if resolve_mode(&state.0.config, headers) == DeliveryMode::Route && result.routed_via != "cache" {
    let location = upstream_url(&result.routed_via, tx_id, path);
    let mut response = redirect_found(&location);
    apply_headers(response.headers_mut(), provenance_headers(&result));
    return response;
  }

  content_response(&result)
}

fn content_response(result: &VerifiedFetch) -> Response {
  let mut builder = Response::builder().status(StatusCode::OK);
  for (name, value) in &result.content.headers {
    if STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
      continue;
    }
    builder = builder.header(name, value);
  }
  if let Some(content_type) = &result.content.content_type {
    builder = builder.header(header::CONTENT_TYPE, content_type);
  }
  for (name, value) in provenance_headers(result) {
    builder = builder.header(name, value);
  }
  builder
    .body(Body::from(result.content.data.clone()))
    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn redirect_found(location: &str) -> Response {
  (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn apply_headers(map: &mut HeaderMap, pairs: Vec<(String, String)>) {
  for (name, value) in pairs {
    if let (Ok(name), Ok(value)) = (
      header::HeaderName::from_bytes(name.as_bytes()),
      header::HeaderValue::from_str(&value),
    ) {
      map.insert(name, value);
    }
  }
}

fn blocked_response(reason: BlockedReason) -> Response {
  let status = match reason {
    BlockedReason::SandboxMismatch => StatusCode::BAD_REQUEST,
    BlockedReason::RestrictionMode => StatusCode::NOT_FOUND,
    BlockedReason::ContentModerated => StatusCode::FORBIDDEN,
  };
  (status, Json(serde_json::json!({ "error": reason.as_str(), "message": reason.as_str() }))).into_response()
}

// ---------------------------------------------------------------------------
// Liveness, readiness, metrics, stats
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
  status: &'static str,
  uptime_seconds: u64,
  version: &'static str,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
  Json(HealthResponse {
    status: "healthy",
    uptime_seconds: state.0.started_at.elapsed().as_secs(),
    version: env!("CARGO_PKG_VERSION"),
  })
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
  let uptime = state.0.started_at.elapsed().as_secs();
  if uptime < READY_MIN_UPTIME_SECS {
    return (
      StatusCode::SERVICE_UNAVAILABLE,
      Json(serde_json::json!({ "status": "not_ready", "reason": "warming_up", "uptime_seconds": uptime })),
    );
  }
  (StatusCode::OK, Json(serde_json::json!({ "status": "ready", "uptime_seconds": uptime })))
}

/// Minimal Prometheus text exposition of the same counters `stats_summary`
/// reports as JSON.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
  let in_flight = state.0.lifecycle.in_flight_count();
  let cache_entries = state.0.api_cache.len().await;
  let cache_size = state.0.api_cache.current_size().await;
  let is_fallback_pool = state.0.pool.is_fallback().await;

  let body = format!(
    "# HELP wayfinder_in_flight_requests Requests currently being served\n\
     # TYPE wayfinder_in_flight_requests gauge\n\
     wayfinder_in_flight_requests {in_flight}\n\
     # HELP wayfinder_api_cache_entries Entries in the proxied-API cache\n\
     # TYPE wayfinder_api_cache_entries gauge\n\
     wayfinder_api_cache_entries {cache_entries}\n\
     # HELP wayfinder_api_cache_bytes Bytes held by the proxied-API cache\n\
     # TYPE wayfinder_api_cache_bytes gauge\n\
     wayfinder_api_cache_bytes {cache_size}\n\
     # HELP wayfinder_gateway_pool_is_fallback 1 if the pool is serving the static fallback list\n\
     # TYPE wayfinder_gateway_pool_is_fallback gauge\n\
     wayfinder_gateway_pool_is_fallback {}\n",
    is_fallback_pool as u8
  );

  ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[derive(Serialize)]
struct StatsSummary {
  uptime_seconds: u64,
  in_flight_requests: usize,
  gateway_pool_size: usize,
  gateway_pool_is_fallback: bool,
  api_cache_entries: usize,
  api_cache_bytes: u64,
}

async fn stats_summary(State(state): State<AppState>) -> impl IntoResponse {
  let pool = state.0.pool.get_all_gateways().await;
  Json(StatsSummary {
    uptime_seconds: state.0.started_at.elapsed().as_secs(),
    in_flight_requests: state.0.lifecycle.in_flight_count(),
    gateway_pool_size: pool.len(),
    gateway_pool_is_fallback: state.0.pool.is_fallback().await,
    api_cache_entries: state.0.api_cache.len().await,
    api_cache_bytes: state.0.api_cache.current_size().await,
  })
}

// ---------------------------------------------------------------------------
// Moderation admin surface
// ---------------------------------------------------------------------------

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
  let Some(expected) = &state.0.config.moderation.admin_token else {
    return Err((StatusCode::SERVICE_UNAVAILABLE, "moderation admin token not configured").into_response());
  };
  let provided = headers
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "));
  if provided != Some(expected.as_str()) {
    return Err((StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response());
  }
  Ok(())
}

#[derive(Deserialize)]
struct BlockRequest {
  #[serde(rename = "type")]
  entry_type: BlocklistEntryType,
  value: String,
  reason: String,
  #[serde(default = "default_admin")]
  blocked_by: String,
}

fn default_admin() -> String {
  "admin".to_string()
}

async fn moderation_block(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<BlockRequest>) -> Response {
  if let Err(resp) = authorize(&state, &headers) {
    return resp;
  }

  let entry = BlocklistEntry {
    entry_type: req.entry_type,
    value: req.value.clone(),
    reason: req.reason,
    blocked_at: chrono::Utc::now(),
    blocked_by: req.blocked_by.clone(),
    resolved_tx_id: None,
  };

  if let Err(err) = state.0.blocklist.block(entry).await {
    warn!(error = %err, "failed to persist blocklist entry");
    return (StatusCode::INTERNAL_SERVER_ERROR, "failed to persist blocklist").into_response();
  }

  match req.entry_type {
    BlocklistEntryType::Txid => state.0.api_cache.invalidate_all_paths(&req.value).await,
    BlocklistEntryType::Arns => state.0.resolver.invalidate(&req.value).await,
  }

  state
    .0
    .audit
    .log_moderation_action(uuid::Uuid::new_v4().to_string(), true, req.value, req.blocked_by)
    .await;

  StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
struct UnblockRequest {
  #[serde(rename = "type")]
  entry_type: BlocklistEntryType,
  value: String,
  #[serde(default = "default_admin")]
  unblocked_by: String,
}

async fn moderation_unblock(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<UnblockRequest>) -> Response {
  if let Err(resp) = authorize(&state, &headers) {
    return resp;
  }
  if let Err(err) = state.0.blocklist.unblock(req.entry_type, &req.value).await {
    warn!(error = %err, "failed to persist blocklist removal");
    return (StatusCode::INTERNAL_SERVER_ERROR, "failed to persist blocklist").into_response();
  }

  state
    .0
    .audit
    .log_moderation_action(uuid::Uuid::new_v4().to_string(), false, req.value, req.unblocked_by)
    .await;

  StatusCode::NO_CONTENT.into_response()
}

async fn moderation_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
  if let Err(resp) = authorize(&state, &headers) {
    return resp;
  }
  Json(state.0.blocklist.list().await).into_response()
}

// ---------------------------------------------------------------------------
// GraphQL and read/write-node passthrough, with per-category caching
// ---------------------------------------------------------------------------

async fn graphql_proxy(State(state): State<AppState>, method: Method, headers: HeaderMap, body: Bytes) -> Response {
  let Some(upstream) = &state.0.config.verification.graphql_proxy_url else {
    return (StatusCode::SERVICE_UNAVAILABLE, "graphql proxy not configured").into_response();
  };
  forward(&state.0.http_client, method, upstream, &headers, body).await
}

async fn api_proxy(State(state): State<AppState>, uri: OriginalUri, method: Method, headers: HeaderMap, body: Bytes) -> Response {
  let path = uri.0.path().to_string();
  let category = path.split('/').nth(1).unwrap_or("").to_string();

  if method == Method::GET {
    if let Some(cached) = state.0.api_cache.get(&category, &path).await {
      return proxied_cache_response(cached);
    }
  }

  let Some(source) = state.0.pool.get_all_gateways().await.into_iter().next() else {
    return (StatusCode::SERVICE_UNAVAILABLE, "no upstream nodes available").into_response();
  };
  let url = format!("{}{}", source.origin, uri.0.path_and_query().map(|p| p.as_str()).unwrap_or(&path));

  if method != Method::GET {
    return forward(&state.0.http_client, method, &url, &headers, body).await;
  }

  match fetch_cacheable(&state.0.http_client, &url, &headers).await {
    Ok(Some(content)) => {
      state.0.api_cache.put(&category, &path, content.clone()).await;
      proxied_cache_response(content)
    }
    Ok(None) => StatusCode::BAD_GATEWAY.into_response(),
    Err(status) => status.into_response(),
  }
}

async fn forward(client: &reqwest::Client, method: Method, url: &str, headers: &HeaderMap, body: Bytes) -> Response {
  let mut forward_headers = headers.clone();
  for name in STRIPPED_HEADERS {
    forward_headers.remove(*name);
  }

  let request = client.request(method, url).headers(forward_headers).body(body);
  match request.send().await {
    Ok(upstream) => {
      let status = upstream.status();
      let mut builder = Response::builder().status(status);
      for (name, value) in upstream.headers() {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
          continue;
        }
        builder = builder.header(name, value);
      }
      match upstream.bytes().await {
        Ok(bytes) => builder.body(Body::from(bytes)).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
        Err(_) => StatusCode::BAD_GATEWAY.into_response(),
      }
    }
    Err(err) => {
      warn!(error = %err, url, "upstream proxy request failed");
      GatewayError::Gateway { status: 502, message: err.to_string() }.into_response()
    }
  }
}

/// Issues a GET and, on a successful response, materializes it as
/// `CachedContent` so the caller can both serve and cache it. Returns
/// `Err` on a non-2xx or transport failure, `Ok(None)` if the body
/// couldn't be read.
async fn fetch_cacheable(client: &reqwest::Client, url: &str, headers: &HeaderMap) -> Result<Option<CachedContent>, StatusCode> {
  let mut forward_headers = headers.clone();
  for name in STRIPPED_HEADERS {
    forward_headers.remove(*name);
  }

  let upstream = client
    .get(url)
    .headers(forward_headers)
    .send()
    .await
    .map_err(|_| StatusCode::BAD_GATEWAY)?;

  if !upstream.status().is_success() {
    return Err(StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
  }

  let content_type = upstream
    .headers()
    .get(header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_string());
  let response_headers: Vec<(String, String)> = upstream
    .headers()
    .iter()
    .filter_map(|(name, value)| {
      let name = name.as_str();
      if STRIPPED_HEADERS.contains(&name) {
        return None;
      }
      value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
    })
    .collect();

  let Ok(bytes) = upstream.bytes().await else {
    return Ok(None);
  };

  let now = SystemTime::now();
  Ok(Some(CachedContent {
    content_length: bytes.len(),
    data: bytes,
    content_type,
    headers: response_headers,
    verified_at: now,
    tx_id: String::new(),
    hash: None,
    access_count: 0,
    last_accessed: now,
  }))
}

fn proxied_cache_response(content: CachedContent) -> Response {
  let mut builder = Response::builder().status(StatusCode::OK);
  for (name, value) in &content.headers {
    if STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
      continue;
    }
    builder = builder.header(name, value);
  }
  if let Some(content_type) = &content.content_type {
    builder = builder.header(header::CONTENT_TYPE, content_type);
  }
  builder
    .body(Body::from(content.data))
    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
