//! LedgerCA server binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ledgerca_server::{Server, ServerConfig};
use tokio::signal;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "ledgerca-server-config.yaml";

/// LedgerCA - certificate authority server
#[derive(Parser)]
#[command(name = "ledgerca-server", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server home directory; relative paths in the config resolve against it
    #[arg(long, env = "LEDGERCA_HOME", default_value = ".")]
    home: PathBuf,

    /// Configuration file (default: <home>/ledgerca-server-config.yaml)
    #[arg(long, short, env = "LEDGERCA_CONFIG")]
    config: Option<PathBuf>,

    /// Bootstrap registrar identity as id:secret
    #[arg(long, short)]
    boot: Option<String>,

    /// Affiliation for the bootstrap identity
    #[arg(long, default_value = "")]
    boot_affiliation: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create CA key material, database and bootstrap data, then exit
    Init {
        /// Replace an existing CA key and certificate
        #[arg(long)]
        renew: bool,
    },
    /// Initialize if needed and serve
    Start,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.home.join(DEFAULT_CONFIG_FILE));
    let mut config = ServerConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Some(boot) = &cli.boot {
        let (id, secret) = boot
            .split_once(':')
            .context("--boot must be of the form id:secret")?;
        config.add_bootstrap_identity(id, secret, &cli.boot_affiliation)?;
    }

    let mut server = Server::new(config, &cli.home);
    match cli.command {
        Commands::Init { renew } => {
            server.init(renew).await?;
            tracing::info!(home = %cli.home.display(), "Initialization complete");
            Ok(())
        }
        Commands::Start => serve(server).await,
    }
}

async fn serve(mut server: Server) -> anyhow::Result<()> {
    let blocking = server.config().blocking;
    tokio::select! {
        result = server.start() => result?,
        () = shutdown_signal() => return Ok(()),
    }
    if !blocking {
        shutdown_signal().await;
        server.stop()?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
