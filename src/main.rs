mod cli;
mod commands;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// High worker counts fragment glibc malloc badly; mimalloc keeps the
// resident set stable under churn.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use trawler_core::AppConfig;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig =
        toml::from_str(&config_str).with_context(|| format!("parsing {}", cli.config))?;
    apply_env_overrides(&mut config);

    // CLI flags outrank environment and file
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    if let Some(file) = &cli.log_file {
        config.log.file = Some(file.clone());
    }
    init_tracing(&config)?;

    if !std::path::Path::new(&cli.config).exists() {
        warn!(path = %cli.config, "config file not found, using built-in defaults");
    }

    match cli.command {
        Commands::Master { seed_urls } => commands::master::run(config, seed_urls).await,
        Commands::Worker { worker_id, workers } => {
            commands::worker::run(config, worker_id, workers).await
        }
        Commands::Standalone { urls } => commands::standalone::run(config, urls).await,
        Commands::Benchmark {
            url,
            requests,
            concurrency,
        } => commands::benchmark::run(config, url, requests, concurrency).await,
        Commands::Stats => commands::stats::run(config).await,
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("REDIS_HOST") {
        config.broker.host = v;
    }
    if let Ok(v) = std::env::var("REDIS_PORT") {
        if let Ok(port) = v.parse::<u16>() {
            config.broker.port = port;
        }
    }
    if let Ok(v) = std::env::var("REDIS_DB") {
        if let Ok(db) = v.parse::<i64>() {
            config.broker.db = db;
        }
    }
    if let Ok(v) = std::env::var("REDIS_PASSWORD") {
        if !v.is_empty() {
            config.broker.password = Some(v);
        }
    }
    if let Ok(v) = std::env::var("STORAGE_TYPE") {
        config.storage.storage_type = v;
    }
    if let Ok(v) = std::env::var("FILE_PATH") {
        config.storage.file_path = v;
    }
    if let Ok(v) = std::env::var("LOG_LEVEL") {
        config.log.level = v;
    }
    if let Ok(v) = std::env::var("LOG_FILE") {
        config.log.file = Some(v);
    }
    if let Ok(v) = std::env::var("WORKER_ID") {
        config.worker_id = v;
    }
    if let Ok(v) = std::env::var("MASTER_HOST") {
        config.master.host = v;
    }
    if let Ok(v) = std::env::var("MASTER_PORT") {
        if let Ok(port) = v.parse::<u16>() {
            config.master.port = port;
        }
    }
}

fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_lowercase()));
    match &config.log.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
