//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了配置检查命令的实现。

use crate::cli::CheckArgs;
use crate::config::{CacheKind, Config};
use anyhow::{Context, Result};

pub async fn execute(args: &CheckArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Invalid configuration: {}", args.config.display()))?;

    println!("✅ Configuration is valid: {}", args.config.display());
    println!("Namespace: {}", config.global.namespace);
    println!("Substrate: {:?}", config.substrate.mode);
    println!("Caches:    {}", config.caches.len());

    if args.verbose {
        let mut names: Vec<&String> = config.caches.keys().collect();
        names.sort();
        for name in names {
            let cache = &config.caches[name];
            println!("  - {:<24} {}", name, describe(&cache.kind));
        }
    }

    Ok(())
}

fn describe(kind: &CacheKind) -> &'static str {
    match kind {
        CacheKind::Loading => "loading",
        CacheKind::Distributed => "distributed",
        CacheKind::Tiered => "tiered",
        CacheKind::RefreshAhead => "refresh_ahead",
        CacheKind::ConsumableList => "consumable_list",
        CacheKind::ConsumableMap => "consumable_map",
        CacheKind::Bounded => "bounded",
        CacheKind::Counter => "counter",
    }
}
