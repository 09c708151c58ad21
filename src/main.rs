use std::sync::Arc;

use clap::Parser;
use config::Config;
use serde::Deserialize;
use tracing::{info, warn};
use tunestream::{
    auth::{AuthConfig, TokenAuthorizer},
    create_app,
    fetcher::{ResilientFetcher, RetryPolicy},
    remote::{HttpBlobStore, HttpStoreConfig, MemoryBlobStore, RemoteFileLocator},
    stream::{MediaStreamer, StreamConfig},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    server: ServerConfig,
    storage: StorageConfig,
    #[serde(default)]
    retry: RetryPolicy,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    stream: StreamConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
enum StorageConfig {
    Http(HttpStoreConfig),
    Memory,
}

/// `TUNESTREAM__STORAGE__BASE_URL=...` style overrides. Values are parsed so
/// numbers survive the tagged `storage` section.
fn env_overrides() -> config::Environment {
    config::Environment::with_prefix("TUNESTREAM")
        .separator("__")
        .try_parsing(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(env_overrides())
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!("Configuration loaded from {}", args.config);

    let locator: Arc<dyn RemoteFileLocator> = match &settings.storage {
        StorageConfig::Http(store) => {
            info!("Using HTTP blob store at {}", store.base_url);
            Arc::new(HttpBlobStore::new(store)?)
        }
        StorageConfig::Memory => {
            warn!("Using empty in-memory store; every lookup will 404");
            Arc::new(MemoryBlobStore::new())
        }
    };

    if settings.auth.allow_anonymous {
        warn!("Anonymous access enabled for private media");
    } else if settings.auth.tokens.is_empty() {
        warn!("No auth tokens configured; private media will answer 401");
    }

    info!(
        "Retry policy: max_retries={} base_delay_ms={} jitter_max_ms={}",
        settings.retry.max_retries, settings.retry.base_delay_ms, settings.retry.jitter_max_ms
    );

    let streamer = MediaStreamer::new(
        locator,
        ResilientFetcher::new(settings.retry.clone()),
        settings.stream.clone(),
    );
    let app = create_app(streamer, Arc::new(TokenAuthorizer::new(&settings.auth)));

    let host = args.host.unwrap_or(settings.server.host);
    let port = args.port.unwrap_or(settings.server.port);
    let addr = format!("{}:{}", host, port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
