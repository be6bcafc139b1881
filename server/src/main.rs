use std::sync::Arc;

use anyhow::{Context, Result};
use app::RouterCtx;
use clap::Parser;
use conf::Conf;
use imager::Imager;
use metrics::ServiceMetrics;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod conf;
mod metrics;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "config.toml")]
    pub config_file: Vec<String>,

    /// Server port (overrides config)
    #[arg(long)]
    pub server_port: Option<u16>,
}

fn setup_tracing(log_format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log_format {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    }
    .map_err(|err| anyhow::anyhow!("{err}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Conf::new(args.config_file).context("reading config file")?;

    setup_tracing(&config.log_format).context("setting up tracing")?;

    info!("Starting app with config: {:?}", &config);

    std::fs::create_dir_all(&config.upload_root).context("creating upload root")?;
    let imager = Imager::new(config.imager.clone())
        .await
        .context("setting up storage backends")?
        .with_upload_root(&config.upload_root)
        .context("resolving upload root")?;
    let ctx = RouterCtx {
        imager: Arc::new(imager),
        api_key: config.api_key.clone(),
        metrics: Arc::new(ServiceMetrics::new().context("registering metrics")?),
    };
    let router = app::router(ctx, config.rest_server_max_body_size);

    let port = args.server_port.unwrap_or(config.rest_server_port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!("{} listening on {}", config.id, listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    Ok(())
}
