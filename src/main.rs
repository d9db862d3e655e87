//! # artesync
//!
//! Command-line entry point.
//!
//! ## Startup
//!
//! 1. **Configuration** - load and validate the TOML configuration
//! 2. **Store** - open the JSON state file, or keep state in memory
//! 3. **Processor** - register one document synchronizer per configured type
//! 4. **Pass or Loop** - run one pass, or the scheduled loop until Ctrl+C

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use artesync_core::SyncConfig;
use artesync_reconciler::{
    ArtefactStore, DocumentSynchronizer, FileSystemRepository, InMemoryArtefactStore,
    JsonFileArtefactStore, LoopConfig, NoOpExecutor, ProcessorBuilder, ProcessorConfig,
    SyncLoop, SynchronizationProcessor,
};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, root } => run(config.as_deref(), root).await,
        Commands::Watch { config, root } => watch(config.as_deref(), root).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

/// Initialize tracing with `RUST_LOG` support, defaulting to `info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(root) = root {
        config.registry_root = root;
    }
    if config.synchronizers.is_empty() {
        bail!("No synchronizers configured. Add at least one [[synchronizers]] entry");
    }
    Ok(config)
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn ArtefactStore>> {
    match &config.state_file {
        Some(path) => {
            let store = JsonFileArtefactStore::open(path, &config.actor)
                .await
                .with_context(|| format!("Failed to open state file {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No state_file configured, artefact state is kept in memory only");
            Ok(Arc::new(InMemoryArtefactStore::new(&config.actor)))
        }
    }
}

async fn build_processor(config: &SyncConfig) -> Result<Arc<SynchronizationProcessor>> {
    let store = open_store(config).await?;

    let builder = ProcessorBuilder::new()
        .with_source(Arc::new(FileSystemRepository::new(&config.registry_root)))
        .with_config(ProcessorConfig::from(config));

    let processor = config
        .synchronizers
        .iter()
        .fold(builder, |builder, entry| {
            info!(
                artefact_type = %entry.artefact_type,
                extension = %entry.extension(),
                "Registering synchronizer"
            );
            builder.with_synchronizer(Arc::new(
                DocumentSynchronizer::new(
                    &entry.artefact_type,
                    entry.extension(),
                    Arc::clone(&store),
                    Arc::new(NoOpExecutor),
                )
                .with_start_stop(entry.supports_start_stop),
            ))
        })
        .build()
        .context("Failed to assemble synchronization processor")?;

    Ok(Arc::new(processor))
}

async fn run(config_path: Option<&Path>, root: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, root)?;
    let processor = build_processor(&config).await?;

    let report = processor
        .force_pass()
        .await
        .context("Synchronization pass failed")?;

    if !report.is_clean() {
        warn!(errors = report.errors.len(), "Pass finished with errors");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn watch(config_path: Option<&Path>, root: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, root)?;
    let processor = build_processor(&config).await?;

    let mut sync_loop = SyncLoop::new(processor, LoopConfig::from(&config));
    let stopper = sync_loop.stopper();

    tokio::spawn(async move {
        wait_for_shutdown().await;
        stopper.stop();
    });

    sync_loop.run().await.context("Synchronization loop failed")?;
    info!("Shutdown complete");
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = SyncConfig::load(path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
