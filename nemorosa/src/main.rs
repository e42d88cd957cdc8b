use crate::app::{App, AppError, RunMode};
use clap::Parser;
use log::{error, info};
use nemorosa_core::config::{AppConfig, DownloaderSettings, LogLevel};
use nemorosa_core::torrent::InfoHash;
use std::path::PathBuf;
use std::str::FromStr;

mod app;
mod logging;
mod server;

const EXIT_SUCCESS: i32 = 0;
const EXIT_RUNTIME: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_NO_CLIENT: i32 = 3;

/// Cross-seeds music torrents to Gazelle-family trackers.
#[derive(Debug, Parser)]
#[command(name = "nemorosa", version = nemorosa_core::VERSION)]
struct NemorosaArgs {
    /// Path of the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Torrent client url, overrides the configured downloader.
    #[arg(long)]
    client: Option<String>,

    /// Dry run, stop after matching without downloading or injecting.
    #[arg(long)]
    no_download: bool,

    /// Replay the failed downloads recorded in the retry ledger.
    #[arg(short = 'r', long)]
    retry_undownloaded: bool,

    /// Run the webhook server instead of a one-shot scan.
    #[arg(short = 's', long)]
    server: bool,

    /// Process a single torrent by its info hash.
    #[arg(short = 't', long, value_name = "HASH")]
    torrent: Option<String>,

    /// Host the server binds to, overrides the configured host.
    #[arg(long)]
    host: Option<String>,

    /// Port the server binds to, overrides the configured port.
    #[arg(long)]
    port: Option<u16>,

    /// Root log level, one of debug, info, warning, error or critical.
    #[arg(short = 'l', long)]
    loglevel: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = NemorosaArgs::parse();
    std::process::exit(run(args).await);
}

async fn run(args: NemorosaArgs) -> i32 {
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nemorosa: {}", e);
            return EXIT_CONFIG;
        }
    };

    logging::init(config.global.loglevel.into());
    info!("nemorosa {} starting", nemorosa_core::VERSION);

    let mode = match run_mode(&args, &config) {
        Ok(mode) => mode,
        Err(e) => {
            error!("{}", e);
            return EXIT_CONFIG;
        }
    };

    let app = match App::bootstrap(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("{}", e);
            return match e {
                AppError::Config(_) => EXIT_CONFIG,
                AppError::ClientUnreachable(_) => EXIT_NO_CLIENT,
                AppError::Runtime(_) => EXIT_RUNTIME,
            };
        }
    };

    match app.run(mode).await {
        Ok(_) => EXIT_SUCCESS,
        Err(e) => {
            error!("{}", e);
            match e {
                AppError::Config(_) => EXIT_CONFIG,
                AppError::ClientUnreachable(_) => EXIT_NO_CLIENT,
                AppError::Runtime(_) => EXIT_RUNTIME,
            }
        }
    }
}

/// Load the configuration file and apply the command line overrides.
fn load_config(args: &NemorosaArgs) -> nemorosa_core::config::Result<AppConfig> {
    let mut config = AppConfig::from_file(&args.config)?;

    if let Some(client) = args.client.as_ref() {
        config.downloader = Some(DownloaderSettings {
            client: client.clone(),
            label: config
                .downloader
                .as_ref()
                .map(|e| e.label.clone())
                .unwrap_or_else(|| "nemorosa".to_string()),
        });
    }
    if args.no_download {
        config.global.no_download = true;
    }
    if let Some(host) = args.host.as_ref() {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.loglevel.as_deref() {
        config.global.loglevel = parse_loglevel(level)?;
    }

    config.validate()?;
    Ok(config)
}

fn parse_loglevel(value: &str) -> nemorosa_core::config::Result<LogLevel> {
    match value.to_lowercase().as_str() {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warning" => Ok(LogLevel::Warning),
        "error" => Ok(LogLevel::Error),
        "critical" => Ok(LogLevel::Critical),
        _ => Err(nemorosa_core::config::ConfigError::Invalid(format!(
            "unknown log level \"{}\"",
            value
        ))),
    }
}

/// Decide the run mode from the command line flags.
fn run_mode(args: &NemorosaArgs, config: &AppConfig) -> Result<RunMode, AppError> {
    if let Some(hash) = args.torrent.as_deref() {
        let hash = InfoHash::from_str(hash)
            .map_err(|e| AppError::Config(format!("invalid torrent hash, {}", e)))?;
        return Ok(RunMode::Single(hash));
    }
    if args.retry_undownloaded {
        return Ok(RunMode::Retry);
    }
    if args.server {
        return Ok(RunMode::Server {
            host: config.server.host.clone(),
            port: config.server.port,
        });
    }

    Ok(RunMode::Scan)
}
