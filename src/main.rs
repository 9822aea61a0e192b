//! genproxy CLI

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use genproxy::config::{Backend, Config, Mode};
use genproxy::engine::Engine;
use genproxy::intercept::InterceptionRule;
use genproxy::network::{HttpClient, ProxyServer, Upstream};
use genproxy::storage::{KvStore, MemoryStore, RecordingStore, RedisStore};

/// HTTP(S) record/playback proxy
#[derive(Debug, Parser)]
#[command(name = "genproxy", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Record responses instead of playing them back
    #[arg(long)]
    record: bool,

    /// Regex over `host:port` selecting managed destinations
    #[arg(long)]
    destination: Option<String>,

    /// Listen address
    #[arg(long, env = "PROXY_ADDR")]
    listen: Option<SocketAddr>,

    /// Listen port, replacing the port of the listen address
    #[arg(short, long, env = "PROXY_PORT")]
    port: Option<u16>,

    /// Redis URL for the recording store
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Keep recordings in process memory instead of redis
    #[arg(long)]
    memory_store: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if self.record {
            config.mode = Mode::Record;
        }
        if let Some(destination) = self.destination {
            config.intercept.destination = destination;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(port) = self.port {
            config.listen_addr.set_port(port);
        }
        if let Some(url) = self.redis_url {
            config.storage.redis_url = url;
        }
        if self.memory_store {
            config.storage.backend = Backend::Memory;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    let backend: Arc<dyn KvStore> = match config.storage.backend {
        Backend::Redis => Arc::new(
            RedisStore::connect(&config.storage.redis_url)
                .await
                .context("Recording store unavailable")?,
        ),
        Backend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.into_config()?;
    let rule = InterceptionRule::from_config(&config.intercept)?;

    let backend = open_store(&config).await?;
    let store = RecordingStore::from_config(backend, &config.storage);
    let upstream: Arc<dyn Upstream> = Arc::new(HttpClient::from_limits(&config.limits));
    let engine = Arc::new(Engine::new(
        config.mode,
        config.fingerprint.clone(),
        store,
        Arc::clone(&upstream),
    ));

    let mode = engine.mode();
    let destination = rule.destination_pattern().to_string();
    let server = ProxyServer::bind(&config, engine, rule, upstream).await?;

    info!(
        "genproxy v{} listening on {} (mode: {}, destination: {}, storage: {:?})",
        env!("CARGO_PKG_VERSION"),
        server.local_addr()?,
        mode,
        destination,
        config.storage.backend
    );

    server
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, shutting down");
            }
        })
        .await?;

    Ok(())
}
