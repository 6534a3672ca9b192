//! Command line interface for aggregating Nostr badge state. Supports
//! profile-badge aggregation, awarded/created badge listings, and profile
//! metadata and relay-list lookups, all fanned out across relays.

mod badges;
mod config;
mod dedup;
mod event;
mod fanout;
mod profile;
mod protocol;
mod relay;
#[cfg(test)]
mod testutil;

use std::{fs, path::Path};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use badges::AggregateOptions;
use config::Settings;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "badgr", author, version, about = "Multi-relay Nostr badge aggregator")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Query these relays instead of discovering the subject's own.
    #[arg(long = "relay", value_name = "URL")]
    relays: Vec<String>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Aggregate the subject's profile badges with resolved definitions.
    Badges { pubkey: String },
    /// List badges awarded to the subject.
    Awarded { pubkey: String },
    /// List badge definitions created by the subject.
    Created { pubkey: String },
    /// Show the subject's profile metadata.
    Profile { pubkey: String },
    /// Show the subject's advertised relay list.
    Relays { pubkey: String },
}

/// Which of the subject's advertised relays a query should target.
enum Audience {
    /// Content the subject published themselves.
    Content,
    /// Events from others that mention the subject.
    Mentions,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let opts = cfg.aggregate_options();
    match cli.command {
        Commands::Badges { pubkey } => {
            let relays = select_relays(&cli.relays, &cfg, &pubkey, &opts, Audience::Content).await;
            let outcome = badges::collect_badges(&pubkey, &relays, &opts).await?;
            print_json(&outcome)
        }
        Commands::Awarded { pubkey } => {
            let relays = select_relays(&cli.relays, &cfg, &pubkey, &opts, Audience::Mentions).await;
            let outcome = badges::collect_awarded(&pubkey, &relays, &opts).await?;
            print_json(&outcome)
        }
        Commands::Created { pubkey } => {
            let relays = select_relays(&cli.relays, &cfg, &pubkey, &opts, Audience::Content).await;
            let outcome = badges::collect_created(&pubkey, &relays, &opts).await?;
            print_json(&outcome)
        }
        Commands::Profile { pubkey } => {
            let relays = select_relays(&cli.relays, &cfg, &pubkey, &opts, Audience::Content).await;
            let (meta, failures) = profile::fetch_metadata(&pubkey, &relays, &opts).await?;
            print_json(&json!({ "profile": meta, "failures": failures }))
        }
        Commands::Relays { pubkey } => {
            let index = if cli.relays.is_empty() {
                cfg.index_relays.clone()
            } else {
                cli.relays.clone()
            };
            let (list, failures) = profile::fetch_relay_list(&pubkey, &index, &opts).await?;
            print_json(&json!({ "relays": list, "failures": failures }))
        }
    }
}

/// Pick query endpoints: explicit flags win, then the subject's advertised
/// relays, then the configured fallback set.
async fn select_relays(
    flags: &[String],
    cfg: &Settings,
    pubkey: &str,
    opts: &AggregateOptions,
    audience: Audience,
) -> Vec<String> {
    if !flags.is_empty() {
        return flags.to_vec();
    }
    if !cfg.index_relays.is_empty() {
        if let Ok((Some(list), _)) = profile::fetch_relay_list(pubkey, &cfg.index_relays, opts).await
        {
            let targets = match audience {
                Audience::Content => list.content_targets(),
                Audience::Mentions => list.mention_targets(),
            };
            if !targets.is_empty() {
                return targets;
            }
        }
    }
    cfg.relays.clone()
}

/// Pretty-print a value as JSON on stdout.
fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("RELAYS=wss://relay.damus.io,wss://nos.lol,wss://relay.nostr.band\n");
    content.push_str("INDEX_RELAYS=wss://purplepag.es\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("READ_TIMEOUT_MS=5000\n");
    content.push_str("STAGE_TIMEOUT_MS=10000\n");
    content.push_str("RESOLVE_TIMEOUT_MS=5000\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
