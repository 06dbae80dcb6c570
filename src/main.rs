use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wayfinder_gateway::{Config, Gateway};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Configuration file path
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Enable debug logging
  #[arg(long)]
  debug: bool,

  /// Override the listen address (host:port)
  #[arg(long)]
  listen: Option<String>,

  /// Skip the blocking gateway-discovery round on startup
  #[arg(long)]
  skip_health_checks: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  let filter = if args.debug {
    EnvFilter::new("debug,wayfinder_gateway=debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,wayfinder_gateway=debug"))
  };
  tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(listen) = &args.listen {
    apply_listen_override(&mut config, listen);
  }
  if args.skip_health_checks {
    warn!("starting with gateway discovery deferred to background refresh");
  }

  info!(base_domain = %config.server.base_domain, "starting gateway");
  let gateway = Gateway::new(config, args.skip_health_checks).await?;
  info!(gateways = gateway.gateway_pool_size().await, "gateway pool ready");
  gateway.run().await
}

fn apply_listen_override(config: &mut Config, listen: &str) {
  match listen.rsplit_once(':') {
    Some((host, port)) => {
      config.server.host = host.to_string();
      if let Ok(port) = port.parse() {
        config.server.port = port;
      }
    }
    None => config.server.host = listen.to_string(),
  }
}
