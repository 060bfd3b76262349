//! Sharewatch - shared directory change notifications over WebSocket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sharewatch::config::{AppConfig, ConfigError, ConfigLoader};
use sharewatch::server::{AppState, WatchServer};
use sharewatch::watch::{LocalBackend, WatchBackend, WatchRegistry};

#[derive(Parser)]
#[command(
    name = "sharewatch",
    about = "Shared directory change notifications over WebSocket",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a config file (defaults to ./sharewatch.toml, then the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watch server.
    Serve {
        /// Host address to bind to.
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration.
    Config,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => {
            let config = ConfigLoader::load_from_path(&path)?;
            config.validate()?;
            Ok(config)
        }
        None => ConfigLoader::new().load(),
    }
}

async fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> ExitCode {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let backend: Arc<dyn WatchBackend> = Arc::new(LocalBackend::new(&config.connections));
    let registry = WatchRegistry::new(backend, &config.watch);
    let state = AppState::new(registry.clone(), config.watch.case_insensitive_paths);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
        }
        ctrl_c.cancel();
    });

    tracing::info!(
        connections = config.connections.len(),
        max_retries = config.watch.max_retries,
        "Starting sharewatch"
    );
    let result = WatchServer::new(state, cancel)
        .with_config(config.server)
        .run()
        .await;

    match tokio::task::spawn_blocking(move || registry.shutdown()).await {
        Ok(report) if report.abandoned > 0 => {
            tracing::warn!(abandoned = report.abandoned, "Some watches did not stop cleanly");
        }
        Ok(_) => {}
        Err(err) => tracing::error!(error = %err, "Registry shutdown failed"),
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Server failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::FAILURE
            }
        },
    }
}
