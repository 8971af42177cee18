//! Command-line interface for hookguard.
//!
//! Provides commands for sending protected webhooks, sweeping expired
//! records, inspecting and resetting circuits, and reading the ledger.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::adapters::{HttpMethod, WebhookOptions};
use crate::config::{self, ResolvedConfig};
use crate::core::GuardError;

/// hookguard - Idempotent, circuit-broken webhook dispatch
#[derive(Parser, Debug)]
#[command(name = "hookguard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a webhook through the ledger and circuit breaker
    Send {
        /// Target URL (https)
        url: String,

        /// JSON payload
        #[arg(short, long, conflicts_with = "input")]
        data: Option<String>,

        /// Read the JSON payload from a file (stdin if neither is given)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "POST")]
        method: HttpMethod,

        /// Extra header, as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Send even if an identical call already completed
        #[arg(long)]
        force: bool,
    },

    /// Delete expired ledger records, stale leases and corrupt values
    Sweep {
        /// Keep running, sweeping every SECONDS (until Ctrl-C)
        #[arg(long, value_name = "SECONDS")]
        every: Option<u64>,
    },

    /// Inspect or reset circuit breakers
    Circuit {
        #[command(subcommand)]
        command: CircuitCommands,
    },

    /// Show the settled ledger record for a key
    Ledger {
        /// Operation key (as passed to the ledger, before sanitization)
        key: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum CircuitCommands {
    /// Show the computed state of a circuit
    Status {
        /// Service key (webhooks use "webhook:<host>")
        service: String,
    },

    /// Force a circuit back to closed
    Reset {
        /// Service key
        service: String,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Send {
                url,
                data,
                input,
                method,
                headers,
                timeout_ms,
                force,
            } => {
                let options = WebhookOptions {
                    method,
                    headers: parse_headers(&headers)?,
                    timeout: timeout_ms.map(Duration::from_millis),
                    ttl: None,
                    force_retry: force,
                };
                send_webhook(cfg, &url, data, input, options).await
            }
            Commands::Sweep { every } => sweep(cfg, every).await,
            Commands::Circuit { command } => execute_circuit(cfg, command).await,
            Commands::Ledger { key } => show_ledger(cfg, &key).await,
            Commands::Config => show_config(cfg),
        }
    }
}

/// Send one webhook and print the response as JSON
async fn send_webhook(
    cfg: &ResolvedConfig,
    url: &str,
    data: Option<String>,
    input: Option<PathBuf>,
    options: WebhookOptions,
) -> Result<()> {
    let raw = if let Some(data) = data {
        data
    } else if let Some(path) = input {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No payload provided. Use --data <json>, --input <file> or pipe to stdin");
    };

    let payload: Value = if raw.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&raw).context("Payload is not valid JSON")?
    };

    let executor = config::guard_context(cfg)?.webhooks()?;
    match executor.execute(url, &payload, options).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.deduplicated {
                eprintln!("\n[Already delivered - returned stored response]");
            }
            Ok(())
        }
        Err(GuardError::CircuitOpen { service, retry_at }) => {
            anyhow::bail!("Circuit '{}' is open; retry after {}", service, retry_at)
        }
        Err(e) => Err(e).context("Webhook failed"),
    }
}

/// Run one sweep, or keep sweeping on an interval
async fn sweep(cfg: &ResolvedConfig, every: Option<u64>) -> Result<()> {
    let context = config::guard_context(cfg)?;
    let sweeper = context.sweeper();

    match every {
        None => {
            let report = sweeper.cleanup_expired_operations().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(seconds) => {
            let interval = if seconds == 0 {
                cfg.guard.sweeper.interval()
            } else {
                Duration::from_secs(seconds)
            };
            eprintln!("Sweeping every {}s (Ctrl-C to stop)", interval.as_secs());
            sweeper
                .run_periodic(interval, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
    }

    Ok(())
}

/// Execute circuit subcommands
async fn execute_circuit(cfg: &ResolvedConfig, command: CircuitCommands) -> Result<()> {
    let breakers = config::guard_context(cfg)?.breakers();

    match command {
        CircuitCommands::Status { service } => {
            let status = breakers.status(&service).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        CircuitCommands::Reset { service } => {
            breakers.reset(&service).await?;
            println!("Circuit '{}' reset to CLOSED", service);
        }
    }

    Ok(())
}

/// Show the settled record for a ledger key
async fn show_ledger(cfg: &ResolvedConfig, key: &str) -> Result<()> {
    let ledger = config::guard_context(cfg)?.ledger();

    match ledger.record(key).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("No record for '{}'", key),
    }

    Ok(())
}

/// Show configuration
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("hookguard configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home:        {}", cfg.home.display());
    println!("Store:       {} at {}", cfg.store_backend, cfg.store_path.display());
    println!("Value limit: {} bytes", cfg.max_value_bytes);
    println!();
    println!("{}", serde_yaml::to_string(&cfg.guard)?);

    Ok(())
}

/// Parse "Name: value" header arguments
fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header '{}', expected 'Name: value'", header))?;
            let name = name.trim();
            if name.is_empty() {
                anyhow::bail!("Invalid header '{}': empty name", header);
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
