//! `pypihub` command line: run the index server or inspect its cache.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pypihub_logging::{init_subscriber, LogSettings};
use pypihub_server::{run_server_with_shutdown, AppState, Config, PackageName};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pypihub")]
#[command(about = "PyPIHub - local package index with a caching upstream mirror")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON); built-in defaults apply when absent
    #[arg(long, default_value = "pypihub.json", global = true)]
    config: PathBuf,

    /// Data directory holding the local and cache roots
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Upstream simple index base URL
    #[arg(long, global = true)]
    upstream: Option<String>,

    /// Cache record time-to-live in seconds
    #[arg(long, global = true)]
    ttl: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the index server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the merged listing of a package
    Resolve {
        /// Package name, any spelling
        package: String,
    },

    /// Drop the mirrored files and cache record of a package
    ClearCache {
        /// Package name, any spelling
        package: String,
    },
}

fn load_config(cli: &Cli) -> Result<(Config, PathBuf)> {
    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(upstream) = &cli.upstream {
        config.upstream.simple_url = upstream.clone();
    }
    if let Some(ttl) = cli.ttl {
        config.cache.ttl_secs = ttl;
    }
    let data_dir = cli
        .data
        .clone()
        .unwrap_or_else(|| config.storage.default_data_dir.clone());
    Ok((config, data_dir))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_subscriber(&LogSettings::from_env());
    let cli = Cli::parse();
    let (config, data_dir) = load_config(&cli)?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.default_host.clone());
            let port = port.unwrap_or(config.server.default_port);

            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Ctrl-C received");
                        let _ = shutdown_tx.send(());
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to listen for Ctrl-C, graceful shutdown unavailable");
                        // Dropping the sender would stop the server.
                        std::future::pending::<()>().await;
                    }
                }
            });

            println!("🚀 PyPIHub listening on http://{host}:{port}/simple/");
            run_server_with_shutdown(host, port, data_dir, config, Some(shutdown_rx)).await
        }

        Commands::Resolve { package } => {
            let package = PackageName::parse(&package)?;
            let state = AppState::from_config(config, data_dir)?;
            let entries = state.resolver.build_simple_index_page(&package).await?;

            if entries.is_empty() {
                println!("No files found for {package}");
            }
            for entry in entries {
                println!("{:<6} {}  {}", entry.origin.as_str(), entry.filename, entry.url());
            }
            Ok(())
        }

        Commands::ClearCache { package } => {
            let package = PackageName::parse(&package)?;
            let state = AppState::from_config(config, data_dir)?;
            if state.cache.clear(&package).await? {
                println!("✅ Cleared cache for {package}");
            } else {
                println!("Nothing cached for {package}");
            }
            Ok(())
        }
    }
}
