//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use crate::config::Config;
use crate::coordinator::Coordinator;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "oxflash")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Path to the TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Log filter, overridden by RUST_LOG")]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "status", about = "Ping the store and show pipeline status")]
    Status(StatusArgs),

    #[command(name = "stock", about = "Load flash-sale stock for a voucher")]
    Stock(StockArgs),

    #[command(name = "next-id", about = "Allocate cluster-wide unique IDs")]
    NextId(NextIdArgs),

    #[command(name = "pending", about = "Show unacknowledged order messages")]
    Pending(PendingArgs),
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[arg(short, long, help = "Show detailed information")]
    pub verbose: bool,

    #[arg(short, long, help = "Output metrics in Prometheus format")]
    pub prometheus: bool,
}

#[derive(Parser, Debug)]
pub struct StockArgs {
    #[arg(help = "Voucher ID")]
    pub voucher_id: u64,

    #[arg(help = "Stock available for the flash sale")]
    pub stock: u64,

    #[arg(long, help = "Also write the stock to the order database")]
    pub database: bool,
}

#[derive(Parser, Debug)]
pub struct NextIdArgs {
    #[arg(help = "Business key prefix, e.g. order")]
    pub prefix: String,

    #[arg(short = 'n', long, default_value_t = 1, help = "Number of IDs to allocate")]
    pub count: u32,
}

#[derive(Parser, Debug)]
pub struct PendingArgs {
    #[arg(long, help = "Create the consumer group if it does not exist")]
    pub init: bool,
}

mod id;
mod pending;
mod status;
mod stock;

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

async fn connect(cli: &Cli) -> Result<Coordinator> {
    let config = load_config(cli.config.as_ref())?;
    Coordinator::connect(config)
        .await
        .context("Failed to connect to the store")
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::telemetry::init_tracing("oxflash", cli.log.as_deref());

    let coordinator = connect(&cli).await?;
    let result = match &cli.command {
        Commands::Status(args) => status::execute(&coordinator, args).await,
        Commands::Stock(args) => stock::execute(&coordinator, args).await,
        Commands::NextId(args) => id::execute(&coordinator, args).await,
        Commands::Pending(args) => pending::execute(&coordinator, args).await,
    };
    coordinator.shutdown().await?;
    crate::telemetry::shutdown_tracing();
    result
}
