//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基座连通性检查命令的实现。

use crate::cli::PingArgs;
use crate::config::Config;
use crate::manager::Coordinator;
use anyhow::{Context, Result};
use std::time::Instant;

pub async fn execute(args: &PingArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Invalid configuration: {}", args.config.display()))?;
    let coordinator = Coordinator::connect(config)
        .await
        .context("Failed to connect to substrate")?;

    let name = coordinator.substrate().name();
    for attempt in 1..=args.count.max(1) {
        let start = Instant::now();
        coordinator
            .ping()
            .await
            .with_context(|| format!("Ping {} to {} failed", attempt, name))?;
        println!(
            "PONG from {} ({}/{}): {:.2}ms",
            name,
            attempt,
            args.count.max(1),
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    Ok(())
}
