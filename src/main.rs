use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stadia_spider::cli::db_counts::{self, DbCountsConfig};
use stadia_spider::cli::spider::{self, SpiderConfig};
use stadia_spider::database_ops::stadia::TableName;
use stadia_spider::tracing::{init_tracing, DEFAULT_FILTER};
use stadia_spider::util::env;

#[derive(Parser, Debug)]
#[command(name = "stadia-spider", version, about = "Stadia RPC client and cache spider")]
struct Cli {
    /// SQLite path (defaults to STADIA_SQLITE, then ./spider.sqlite)
    #[arg(long, global = true)]
    sqlite: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Seed the cache and keep refreshing the stalest records until ctrl-c
    Spider {
        /// JSON file of extra seed keys by table name
        #[arg(long)]
        seed_file: Option<PathBuf>,
    },
    /// Fetch one record now and print it
    Fetch {
        /// Table name, e.g. Game or StoreList
        table: TableName,
        key: String,
    },
    /// Call a single RPC method and print the raw response
    Rpc {
        method: String,
        /// JSON request body (defaults to [])
        request: Option<String>,
    },
    /// List the account's captures and record them in the cache
    Captures,
    /// Print per-table record counts
    Counts,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;

    let cli = Cli::parse();
    let spider_cfg = |seed_file| SpiderConfig {
        sqlite: cli.sqlite.clone(),
        seed_file,
    };

    match cli.command {
        Commands::Spider { ref seed_file } => spider::run(spider_cfg(seed_file.clone())).await,
        Commands::Fetch { table, ref key } => spider::fetch(spider_cfg(None), table, key).await,
        Commands::Rpc {
            ref method,
            ref request,
        } => spider::rpc(method, request.as_deref()).await,
        Commands::Captures => spider::captures(spider_cfg(None)).await,
        Commands::Counts => db_counts::run(DbCountsConfig {
            sqlite: cli.sqlite.clone(),
        }),
    }
}
