//! deployd - entry point
//!
//! Repository-triggered deployment orchestrator for SSH-reachable servers.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use deployd::app::options::AppOptions;
use deployd::app::run::run;
use deployd::filesys::file::File;
use deployd::logs::{init_logging, LogLevel, LogOptions};
use deployd::storage::layout::StorageLayout;
use deployd::storage::settings::Settings;
use deployd::utils::build_info;

#[derive(Debug, Parser)]
#[command(name = "deployd", version, about = "Repository-triggered deployment orchestrator")]
struct Cli {
    /// Settings file (JSON). Defaults to settings.json in the data directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(long)]
    port: Option<u16>,

    /// Print the effective configuration (secrets redacted) and exit
    #[arg(long)]
    print_config: bool,
}

async fn load_settings(cli: &Cli) -> Result<(Settings, StorageLayout), String> {
    let default_layout = StorageLayout::default();
    let settings_file = match &cli.config {
        Some(path) => File::new(path),
        None => default_layout.settings_file(),
    };

    let mut settings = if settings_file.exists().await {
        settings_file
            .read_json::<Settings>()
            .await
            .map_err(|e| format!("Unable to read settings file {:?}: {}", settings_file.path(), e))?
    } else if cli.config.is_some() {
        return Err(format!("Settings file {:?} does not exist", settings_file.path()));
    } else {
        Settings::default()
    };
    settings.apply_env_overrides();

    if let Some(level) = &cli.log_level {
        settings.log_level = level.clone();
    }
    if let Some(host) = &cli.host {
        settings.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let layout = settings
        .storage_dir
        .clone()
        .map(StorageLayout::new)
        .unwrap_or(default_layout);
    Ok((settings, layout))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (settings, layout) = match load_settings(&cli).await {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    if cli.print_config {
        println!("{:#?}", settings);
        println!("data directory: {:?}", layout.base_dir);
        return;
    }

    // Initialize logging; the guard flushes file logs on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = match AppOptions::from_settings(&settings, layout) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let build = build_info();
    info!(version = build.version, commit = build.commit, "Running deployd with options: {:?}", options);
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("deployd exited with an error: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
