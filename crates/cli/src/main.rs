//! apicache operator CLI.
//!
//! Runs the offline maintenance the cache core leaves to a scheduler:
//! expiry sweeps, statistics, and table conversion. Results are printed as
//! JSON on stdout; logs go to stderr.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use apicache_core::convert::{ConvertOptions, Direction, TableConverter};
use apicache_core::{AppConfig, CacheDb, CacheRepository};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apicache")]
#[command(about = "Maintenance for the API response cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Row counts per client
    Stats {
        /// Only this client (defaults to every configured client)
        #[arg(short, long)]
        client: Option<String>,
    },

    /// Delete expired responses
    Sweep {
        #[arg(short, long)]
        client: Option<String>,
    },

    /// List provisioned cache tables
    Tables,

    /// Copy rows between a client's plain and compressed tables
    Convert {
        #[command(flatten)]
        target: ConvertArgs,

        /// Replace rows that already exist in the target table
        #[arg(long)]
        overwrite: bool,

        /// Clear processing markers on converted rows
        #[arg(long)]
        reset_processed: bool,
    },

    /// Compare converted rows against their source without writing
    Validate {
        #[command(flatten)]
        target: ConvertArgs,
    },
}

#[derive(clap::Args)]
struct ConvertArgs {
    #[arg(short, long)]
    client: String,

    #[arg(short, long, value_enum)]
    direction: DirectionArg,

    /// Rows per batch (defaults to the configured batch size)
    #[arg(short, long)]
    batch_size: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Compress,
    Decompress,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Compress => Direction::Compress,
            DirectionArg::Decompress => Direction::Decompress,
        }
    }
}

impl ConvertArgs {
    fn converter(&self, repository: CacheRepository, config: &AppConfig, overwrite: bool, reset_processed: bool) -> Result<TableConverter> {
        let options = ConvertOptions { batch_size: self.batch_size.unwrap_or(config.batch_size), overwrite, reset_processed };
        TableConverter::new(repository, &self.client, self.direction.into(), options)
            .with_context(|| format!("cannot convert tables for client '{}'", self.client))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load().context("failed to load configuration")?;
    let db = CacheDb::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open cache database at {}", config.db_path.display()))?;
    let repository = CacheRepository::from_config(db, &config);
    repository.bootstrap().await?;

    tracing::debug!(db_path = %config.db_path.display(), "cache ready");

    match cli.command {
        Commands::Stats { client } => {
            let clients = selected_clients(&config, client)?;
            let mut stats = BTreeMap::new();
            for client in clients {
                let table = repository.table_name(&client)?;
                let counts = repository.stats(&client).await?;
                stats.insert(client, json!({ "table": table, "total": counts.total, "active": counts.active, "expired": counts.expired }));
            }
            print_json(&stats)?;
        }
        Commands::Sweep { client } => {
            let deleted = repository.delete_expired(client.as_deref()).await?;
            print_json(&json!({ "client": client, "deleted": deleted }))?;
        }
        Commands::Tables => {
            print_json(&repository.list_tables().await?)?;
        }
        Commands::Convert { target, overwrite, reset_processed } => {
            let converter = target.converter(repository, &config, overwrite, reset_processed)?;
            let stats = converter.convert_all().await?;
            print_json(&json!({
                "source": converter.source_table(),
                "target": converter.target_table(),
                "stats": stats,
            }))?;
        }
        Commands::Validate { target } => {
            let converter = target.converter(repository, &config, false, false)?;
            let stats = converter.validate_all().await?;
            print_json(&json!({
                "source": converter.source_table(),
                "target": converter.target_table(),
                "stats": stats,
            }))?;
            if !stats.is_clean() {
                bail!("{} of {} rows did not validate", stats.checked - stats.matched, stats.checked);
            }
        }
    }

    Ok(())
}

fn selected_clients(config: &AppConfig, client: Option<String>) -> Result<Vec<String>> {
    match client {
        Some(client) => Ok(vec![client]),
        None => {
            let names = config.client_names();
            if names.is_empty() {
                bail!("no clients configured; pass --client or set APICACHE_CLIENTS__<NAME>__*");
            }
            Ok(names)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
