use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imager::{Imager, ImagerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Derive image variants and push them to storage")]
struct Args {
    /// Configuration files, layered in order. Missing files are skipped.
    #[arg(long, default_value = "config.toml")]
    config_file: Vec<String>,

    /// Variant set to use (defaults to the configured default)
    #[arg(long, global = true, env = "IMAGER_VARIANT")]
    variant: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload every variant of the given images
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Remove every variant of previously uploaded images
    Remove {
        /// Canonical file names as returned by upload, without preset prefix
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ImagerConfig::load(&args.config_file).context("reading config file")?;
    let imager = Imager::new(config).await.context("setting up storage backends")?;
    let variant = args.variant.as_deref();

    match args.command {
        Command::Upload { files } => {
            let result = imager.upload(files, variant).await.context("uploading images")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("serializing upload result")?
            );
        }
        Command::Remove { names } => {
            imager.remove(&names, variant).await.context("removing images")?;
            println!("Removed {} file(s)", names.len());
        }
    }

    Ok(())
}
