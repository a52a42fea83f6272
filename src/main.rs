//! cachewise - Cost-aware LLM request routing with cache admission
//!
//! A local service that routes LLM requests to the cheapest capable model,
//! decides per request whether provider-side context caching pays off, and
//! answers duplicate requests from a short-lived response store.

use std::path::{Path, PathBuf};

use anyhow::Context;
use cachewise::config::{Config, KeySource};
use cachewise::cost::break_even_reuses;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cachewise")]
#[command(about = "Cost-aware LLM request routing with cache admission and deduplication")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the routing server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Do not apply edits to the config file while running
        #[arg(long)]
        no_reload: bool,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Show configured models, their rates and cache break-even counts
    Models {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn load(path: &Path) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    Config::from_file_with_env(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cachewise=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            no_reload,
        } => {
            tracing::info!(config = %config.display(), "Loading configuration");
            let (mut cfg, key_sources) = load(&config)?;

            for (provider, source) in &key_sources {
                if *source == KeySource::None {
                    tracing::warn!(provider = %provider, "No API key configured");
                } else {
                    tracing::debug!(provider = %provider, source = %source, "API key resolved");
                }
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            let watch = if no_reload { None } else { Some(config) };
            cachewise::server::run_server(cfg, watch).await
        }

        Commands::Check { config } => {
            let (cfg, key_sources) = load(&config)?;
            println!("Configuration OK: {}", config.display());
            println!(
                "  {} provider(s), {} model(s) enabled of {}",
                cfg.providers.len(),
                cfg.profiles().len(),
                cfg.models.len()
            );
            for (provider, source) in key_sources {
                println!("  {}: api key from {}", provider, source);
            }
            Ok(())
        }

        Commands::Models { config } => {
            let (cfg, _) = load(&config)?;
            println!(
                "{:<32} {:<9} {:>10} {:>10} {:>9} {:>10}",
                "MODEL", "TIER", "IN/1K", "OUT/1K", "CONTEXT", "BREAK-EVEN"
            );
            for profile in cfg.profiles() {
                let typical = cfg.classifier.typical_tokens(profile.capability_tier);
                let break_even = if !profile.cache_enabled {
                    "disabled".to_string()
                } else if typical < profile.min_cacheable_tokens {
                    "below min".to_string()
                } else {
                    break_even_reuses(&profile, typical).to_string()
                };
                println!(
                    "{:<32} {:<9} {:>10.4} {:>10.4} {:>9} {:>10}",
                    profile.id(),
                    profile.capability_tier.as_str(),
                    profile.cost_per_1k_input_tokens,
                    profile.cost_per_1k_output_tokens,
                    typical,
                    break_even
                );
            }
            Ok(())
        }
    }
}
