//! CLI entry point that resolves configuration and launches the proxy runtime.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ferry_config::{Config, DEFAULT_CONFIG_PATH, FileConfig, Overrides, load_file, resolve_config};
use http::Uri;
use tracing::{debug, info, warn};

use crate::telemetry;

/// Parse CLI arguments, resolve a [`Config`], and run the proxy.
pub(crate) async fn run() -> Result<()> {
    let cli = Cli::parse();
    debug!(config_path = %cli.config.display(), "parsed CLI arguments");
    let config = cli.resolve_configuration()?;

    log_configuration(&config);
    if let Some(address) = config.metrics_address() {
        telemetry::init_metrics(address);
    }

    ferry_core::run(config).await?;
    Ok(())
}

fn log_configuration(config: &Config) {
    let options = config.options();
    info!(
        "starting proxy on http://{} forwarding to {}",
        config.bind_address(),
        config.destination_prefix()
    );
    info!(
        version = ?options.version(),
        version_policy = ?options.version_policy(),
        request_timeout = ?options.request_timeout(),
        response_buffering = options.response_buffering_enabled(),
        "forwarding options"
    );
    info!(
        "streaming content types: {}",
        options.streaming().content_types().join(", ")
    );
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Streaming HTTP reverse proxy with gRPC and WebSocket support."
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the bind address for the proxy (e.g. 0.0.0.0:8080).
    #[arg(long, value_name = "ADDR")]
    bind_address: Option<SocketAddr>,

    /// Override the destination prefix (e.g. http://127.0.0.1:5000/api).
    #[arg(long = "destination", value_name = "URL")]
    destination_prefix: Option<Uri>,

    /// Override the seconds a destination has to start responding.
    #[arg(long = "request-timeout-secs", value_name = "SECS")]
    request_timeout_secs: Option<u64>,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9090).
    #[arg(long, value_name = "ADDR")]
    metrics_address: Option<SocketAddr>,
}

impl Cli {
    /// Merge `.ferry.toml` (if present) with CLI overrides into a [`Config`].
    fn resolve_configuration(&self) -> Result<Config> {
        let file_config = self.load_file_configuration()?;
        let overrides = Overrides::new(
            self.bind_address,
            self.destination_prefix.clone(),
            self.request_timeout_secs.map(Duration::from_secs),
            self.metrics_address,
        );

        if overrides.is_empty() {
            debug!("no CLI overrides supplied");
        } else {
            debug!(
                bind_override = ?self.bind_address,
                destination_override = ?self.destination_prefix,
                timeout_override = ?self.request_timeout_secs,
                metrics_override = ?self.metrics_address,
                "applying CLI overrides"
            );
        }

        let config = resolve_config(file_config, overrides)?;
        debug!(
            bind_address = %config.bind_address(),
            destination_prefix = config.destination_prefix(),
            max_request_body_size = ?config.max_request_body_size(),
            request_body_read_timeout = ?config.request_body_read_timeout(),
            "resolved effective configuration"
        );

        Ok(config)
    }

    /// Attempt to load a [`FileConfig`] from disk.
    fn load_file_configuration(&self) -> Result<Option<FileConfig>> {
        let file_config = load_file(self.config.as_path())?;

        if let Some(ref file) = file_config {
            debug!(
                path = %self.config.display(),
                streaming_content_types = file
                    .streaming_content_types
                    .as_ref()
                    .map_or(0, |types| types.len()),
                "loaded configuration file"
            );
        }

        if file_config.is_none() && self.config.as_path() != Path::new(DEFAULT_CONFIG_PATH) {
            warn!(
                "configuration file {:?} not found; continuing with defaults and CLI overrides",
                self.config
            );
        }

        Ok(file_config)
    }
}
