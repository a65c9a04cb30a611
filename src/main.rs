//! switchyard - OpenAI-compatible gateway over many AI providers
//!
//! Routes each request to a healthy provider, fails over transparently and
//! meters usage against prepaid credits.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::config::{Config, KeySource};

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "OpenAI-compatible gateway with health-scored routing, failover and credits")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured providers, their models and credential sources
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    let default_filter = format!("switchyard={level},tower_http={level}");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load config from {path}"))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let mut cfg = load_config(&config)?;
            init_tracing(&cfg.logging.level);
            tracing::info!(config = %config, "Loaded configuration");

            for (provider, source) in &cfg.key_sources {
                if matches!(source, KeySource::None) {
                    tracing::warn!(provider = %provider, "Provider has no credentials and cannot serve requests");
                }
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            switchyard::proxy::run_server(cfg, shutdown_signal()).await
        }

        Commands::Check { config } => {
            init_tracing("info");
            let cfg = load_config(&config)?;
            println!("Configuration OK: {config}");
            println!("  listen:    {}", cfg.server.listen);
            println!("  database:  {}", cfg.database().path);
            println!("  providers: {}", cfg.providers.len());
            println!("  models:    {}", cfg.models.len());
            println!("  accounts:  {}", cfg.accounts.len());
            Ok(())
        }

        Commands::Providers { config } => {
            init_tracing("warn");
            let cfg = load_config(&config)?;
            for provider in &cfg.providers {
                let source = cfg
                    .key_sources
                    .iter()
                    .find(|(name, _)| name == &provider.name)
                    .map(|(_, source)| source.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "{} ({}) vision={} tools={} streaming={} credentials={} [{}]",
                    provider.name,
                    provider.url,
                    provider.supports_vision,
                    provider.supports_tool_calling,
                    provider.supports_streaming,
                    provider.credentials.len(),
                    source,
                );
                for model in provider.all_models() {
                    println!("  - {model}");
                }
            }
            Ok(())
        }
    }
}
