//! relaygate - streaming inference gateway
//!
//! Relays content-generation calls to an upstream backend as SSE, with
//! heartbeats for buffered calls and per-request usage records.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaygate::config::{Config, KeySource};

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(about = "Streaming inference gateway with heartbeat keep-alive and usage accounting")]
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

    /// Show configured callers and where their upstream keys come from
    Credentials {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

impl Commands {
    fn config_path(&self) -> &str {
        match self {
            Commands::Serve { config, .. }
            | Commands::Check { config }
            | Commands::Credentials { config } => config,
        }
    }
}

fn init_tracing(level: &str) {
    let default_filter = format!("relaygate={level},tower_http={level}");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.command.config_path().to_string();

    let loaded = Config::from_file(&path);
    let level = loaded
        .as_ref()
        .map(|(config, _)| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);

    let (mut config, key_sources) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(config = %path, error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Serve { listen, .. } => {
            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }
            relaygate::proxy::run_server(config).await
        }

        Commands::Check { .. } => {
            let missing = key_sources
                .iter()
                .filter(|(_, source)| *source == KeySource::None)
                .count();
            tracing::info!(
                config = %path,
                upstream = %config.upstream.base_url,
                credentials = key_sources.len(),
                missing_keys = missing,
                database = config.database.is_some(),
                "Configuration is valid"
            );
            Ok(())
        }

        Commands::Credentials { .. } => {
            if key_sources.is_empty() {
                println!("No credentials configured in {}", path);
                return Ok(());
            }
            println!("{:<24} KEY SOURCE", "CALLER");
            for (caller_id, source) in &key_sources {
                println!("{:<24} {}", caller_id, source);
            }
            Ok(())
        }
    }
}
