//! mixnotify - push-notification relay for mix-network clients.
//!
//! This is the main binary entry point. See the `mixnotify` library for
//! the core functionality.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mixnotify::config::ProviderKind;
use mixnotify::notifications::VapidKeys;
use mixnotify::{Config, Service};

#[derive(Parser)]
#[command(name = "mixnotify")]
#[command(version)]
#[command(about = "Push-notification relay for mix-network clients")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registration API, the epoch manager and the dispatch loop.
    Run {
        /// Config file (default: <config dir>/mixnotify/config.json).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Generate a VAPID keypair for the web_push provider.
    VapidKeygen {
        /// Store the keys in the config file and select the web_push provider.
        #[arg(long)]
        save: bool,
        /// Config file to update with --save.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;
    log::info!(
        "Starting mixnotify v{} (gateway {}, provider {:?})",
        env!("CARGO_PKG_VERSION"),
        config.gateway_url,
        config.provider
    );
    Service::from_config(config)?.run(shutdown_signal()).await
}

fn vapid_keygen(save: bool, config_path: Option<PathBuf>) -> Result<()> {
    let keys = VapidKeys::generate();

    if save {
        let path = match config_path {
            Some(path) => path,
            None => Config::default_path()?,
        };
        let mut config = if path.exists() {
            Config::load_from_file(&path)?
        } else {
            Config::default()
        };
        config.provider = ProviderKind::WebPush;
        config.vapid_public_key = Some(keys.public_key_base64url().to_string());
        config.vapid_private_key = Some(keys.private_key_base64url().to_string());
        config.save(&path)?;
        println!("Saved VAPID keys to {}", path.display());
    } else {
        println!("VAPID private key: {}", keys.private_key_base64url());
    }
    println!("VAPID public key (applicationServerKey): {}", keys.public_key_base64url());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::VapidKeygen { save, config } => vapid_keygen(save, config),
    }
}
