// stream-bridge binary: serve still-downloading content over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stream_bridge::config::{ServerConfig, MAX_RESTARTS, RESTART_BACKOFF_SECS};
use stream_bridge::logging;
use stream_bridge::server;
use stream_bridge::supervisor::{run_with_restarts, RestartPolicy};

/// Session-based HTTP streaming bridge
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long, env = "STREAM_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "STREAM_BRIDGE_BIND")]
    bind: Option<SocketAddr>,

    /// Directory for download cache files
    #[arg(long, env = "STREAM_BRIDGE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory for uploaded subtitle files
    #[arg(long, env = "STREAM_BRIDGE_SUBTITLE_DIR")]
    subtitle_dir: Option<PathBuf>,

    /// Download chunk size in bytes
    #[arg(long, env = "STREAM_BRIDGE_CHUNK_SIZE")]
    chunk_size: Option<u64>,

    /// Concurrent chunk fetches per item
    #[arg(long, env = "STREAM_BRIDGE_MAX_CONCURRENCY")]
    max_concurrency: Option<u32>,

    /// Restarts after an unexpected fault before giving up
    #[arg(long, env = "STREAM_BRIDGE_MAX_RESTARTS", default_value_t = MAX_RESTARTS)]
    max_restarts: u32,

    /// Delay before each restart, in seconds
    #[arg(long, env = "STREAM_BRIDGE_RESTART_BACKOFF_SECS", default_value_t = RESTART_BACKOFF_SECS)]
    restart_backoff_secs: u64,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(dir) = &self.cache_dir {
            config.source.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.subtitle_dir {
            config.subtitle_dir = dir.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.source.chunk_size = chunk_size;
        }
        if let Some(max_concurrency) = self.max_concurrency {
            config.source.max_concurrency = max_concurrency;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    let args = Args::parse();
    let config = match args.server_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    };
    info!("stream bridge starting");
    info!("  bind: {}", config.bind);
    info!("  cache dir: {}", config.source.cache_dir.display());
    info!("  subtitle dir: {}", config.subtitle_dir.display());

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ctrl_c.cancel(),
            Err(e) => warn!("cannot listen for ctrl-c: {}", e),
        }
    });

    let policy = RestartPolicy {
        max_restarts: args.max_restarts,
        backoff: Duration::from_secs(args.restart_backoff_secs),
    };
    let result = run_with_restarts(policy, || server::run(config.clone(), stop.clone())).await;

    match result {
        Ok(()) => info!("stream bridge stopped"),
        Err(e) => {
            error!("stream bridge giving up: {:#}", e);
            std::process::exit(1);
        }
    }
}
