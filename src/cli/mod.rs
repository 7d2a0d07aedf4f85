//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "oxcoord")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Log filter, e.g. info,oxcoord=debug")]
    pub log: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "check", about = "Validate a configuration file")]
    Check(CheckArgs),

    #[command(name = "ping", about = "Connect to the configured substrate and ping it")]
    Ping(PingArgs),
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[arg(short, long, help = "Path to the TOML configuration file")]
    pub config: PathBuf,

    #[arg(short, long, help = "List the configured caches")]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
pub struct PingArgs {
    #[arg(short, long, help = "Path to the TOML configuration file")]
    pub config: PathBuf,

    #[arg(short = 'n', long, default_value_t = 1, help = "Number of pings to send")]
    pub count: u32,
}

mod check;
mod ping;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::telemetry::init_tracing("oxcoord", cli.log.as_deref().or(Some("warn")))?;

    let outcome = match &cli.command {
        Commands::Check(args) => check::execute(args).await,
        Commands::Ping(args) => ping::execute(args).await,
    };
    crate::telemetry::shutdown_tracing();
    outcome
}
