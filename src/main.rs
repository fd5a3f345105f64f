//! # tzdispatch CLI
//!
//! Timezone-aware outbound message queue.
//!
//! Usage:
//!   tzdispatch init                                  # Write config, bootstrap schema
//!   tzdispatch enqueue -p twilio --to +1555 -b "Hi"  # Add a pending message
//!   tzdispatch claim -p twilio -l 20                 # Claim a batch for sending
//!   tzdispatch preview -p twilio                     # Dry run of claim
//!   tzdispatch zones                                 # Zones inside the send window now
//!   tzdispatch stats                                 # Queue counts

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use tzdispatch_core::{DispatchConfig, NewMessage, Provider};
use tzdispatch_queue::QueueService;

#[derive(Parser)]
#[command(
    name = "tzdispatch",
    version,
    about = "📨 tzdispatch: timezone-aware outbound message queue",
    long_about = "Queues outbound messages and hands them out in batches, only when the\nrecipient's local hour is inside the send window."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config (if missing) and bootstrap the store schema
    Init,

    /// Add a pending message
    Enqueue {
        /// Provider: twilio, vonage, plivo, sinch
        #[arg(short, long)]
        provider: String,

        /// Recipient address
        #[arg(long)]
        to: String,

        /// Message body
        #[arg(short, long)]
        body: String,

        /// Higher is sent first
        #[arg(long, default_value_t = 0)]
        priority: u8,

        /// Earliest send time (RFC 3339)
        #[arg(long)]
        send_after: Option<String>,

        /// Recipient's IANA time zone
        #[arg(short = 'z', long)]
        time_zone: Option<String>,

        /// Originating record, as table:id
        #[arg(long)]
        origin: Option<String>,
    },

    /// Claim a batch of messages and mark them sent
    Claim {
        #[arg(short, long)]
        provider: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show what claim would return, without changing anything
    Preview {
        #[arg(short, long)]
        provider: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// List configured zones currently inside the send window
    Zones {
        /// Evaluate at this instant (RFC 3339) instead of now
        #[arg(long)]
        at: Option<String>,
    },

    /// Show queue counts
    Stats,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Reset to defaults
    Reset,
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {value}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_origin(value: &str) -> Result<(String, i64)> {
    let (table, id) = value
        .split_once(':')
        .with_context(|| format!("Origin must be table:id, got {value}"))?;
    let id = id.parse().with_context(|| format!("Invalid origin id: {id}"))?;
    Ok((table.to_string(), id))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_service(config: &DispatchConfig) -> Result<QueueService> {
    let store = tzdispatch_store::create_store(&config.store).await?;
    Ok(QueueService::new(config, store)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tzdispatch=debug,tzdispatch_core=debug,tzdispatch_store=debug,tzdispatch_queue=debug"
    } else {
        "warn,tzdispatch=info,tzdispatch_queue=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(DispatchConfig::default_path);
    // init and config reset may target a file that does not exist yet
    let creates_config = matches!(
        cli.command,
        Commands::Init | Commands::Config { action: ConfigAction::Reset }
    );
    let config = match &cli.config {
        Some(path) if creates_config && !path.exists() => DispatchConfig::default(),
        Some(path) => DispatchConfig::load_from(path)?,
        None => DispatchConfig::load()?,
    };

    match cli.command {
        Commands::Init => {
            if config_path.exists() {
                println!("✅ Config exists: {}", config_path.display());
            } else {
                config.save_to(&config_path)?;
                println!("✅ Config saved to: {}", config_path.display());
            }
            let service = open_service(&config).await?;
            println!("✅ Store ready: {} (locking = {})", service.store().name(), service.locking_mode());
            if !service.locking_mode().at_most_once() {
                println!("⚠️  Unlocked mode: run a single claimer per provider.");
            }
        }

        Commands::Enqueue { provider, to, body, priority, send_after, time_zone, origin } => {
            let provider: Provider = provider.parse()?;
            let mut message = NewMessage::new(provider, to, body).with_priority(priority);
            if let Some(at) = send_after {
                message = message.with_send_after(parse_instant(&at)?);
            }
            if let Some(zone) = time_zone {
                message = message.with_time_zone(zone);
            }
            if let Some(origin) = origin {
                let (table, id) = parse_origin(&origin)?;
                message = message.with_origin(table, id);
            }
            let service = open_service(&config).await?;
            print_json(&service.enqueue(message).await?)?;
        }

        Commands::Claim { provider, limit } => {
            let service = open_service(&config).await?;
            print_json(&service.claim(limit, &provider).await?)?;
        }

        Commands::Preview { provider, limit } => {
            let service = open_service(&config).await?;
            print_json(&service.preview(limit, &provider).await?)?;
        }

        Commands::Zones { at } => {
            let now = match at {
                Some(at) => parse_instant(&at)?,
                None => Utc::now(),
            };
            let evaluator = tzdispatch_core::TimeWindowEvaluator::new(config.zones.clone(), config.window);
            print_json(&json!({
                "at": now,
                "window": config.window,
                "validZones": evaluator.valid_zones(now),
            }))?;
        }

        Commands::Stats => {
            let service = open_service(&config).await?;
            print_json(&service.stats().await?)?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Reset => {
                DispatchConfig::default().save_to(&config_path)?;
                println!("✅ Configuration reset to defaults: {}", config_path.display());
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origin() {
        assert_eq!(parse_origin("appointments:42").unwrap(), ("appointments".to_string(), 42));
        assert!(parse_origin("appointments").is_err());
        assert!(parse_origin("appointments:x").is_err());
    }

    #[test]
    fn test_parse_instant_normalizes_to_utc() {
        let at = parse_instant("2026-01-15T03:00:00-05:00").unwrap();
        assert_eq!(at.to_rfc3339(), "2026-01-15T08:00:00+00:00");
    }

    #[test]
    fn test_cli_parses_claim() {
        let cli = Cli::try_parse_from(["tzdispatch", "claim", "-p", "twilio", "-l", "25"]).unwrap();
        assert!(matches!(cli.command, Commands::Claim { limit: 25, .. }));
    }
}
