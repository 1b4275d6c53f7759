//! Storage-server daemon and crawler-state migration CLI (spec.md §4.J,
//! component "CLI / migration tool"). A thin binary: it parses already-
//! materialized configuration off the command line, constructs the library
//! types from `storage-core`/`storage-crawler` and wires them together for
//! local operation. No RPC transport is implemented here (out of scope,
//! SPEC_FULL.md §1) — `serve` just runs the admission-controlled share
//! store and its background lease-expiring crawler side by side until
//! interrupted.

mod cli;
mod migrate;

use std::collections::HashSet;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use storage_core::{StorageConfig, StorageServer};
use storage_crawler::{CrawlerTiming, ExpirationMode, ExpirerConfig, LeaseExpirer, ShareCrawler, ShareTypeFilter};
use storage_types::NodeId;

use cli::{Cli, Commands, ExpirationModeArg, ServeCmd, ShareTypeArg};

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match &cli.command {
        Commands::Serve(cmd) => serve(cmd).await,
        Commands::MigrateCrawlerState(cmd) => migrate::migrate_crawler_state(cmd).await,
    }
}

async fn serve(cmd: &ServeCmd) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(&cmd.basedir)?;
    let node_id = load_or_create_node_id(&cmd.basedir)?;

    let config = StorageConfig {
        basedir: cmd.basedir.clone(),
        reserved_space: cmd.reserved_space,
        readonly_storage: cmd.readonly,
    };
    let server = Arc::new(StorageServer::new(config, node_id)?);
    log::info!("storage server ready at {} (node {})", cmd.basedir.display(), node_id);

    let expirer_config = build_expirer_config(cmd)?;
    let visitor = LeaseExpirer::new(expirer_config);
    let (mut crawler, mut visitor) = ShareCrawler::new(
        Arc::clone(&server),
        cmd.basedir.join("lease_checker.state"),
        cmd.basedir.join("lease_checker.history"),
        CrawlerTiming::default(),
        visitor,
    )?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    })?;

    tokio::select! {
        result = crawler.run_forever(&mut visitor) => result.map_err(|e| e.into()),
        _ = shutdown_rx.changed() => Ok(()),
    }
}

fn load_or_create_node_id(basedir: &Path) -> std::io::Result<NodeId> {
    let path = basedir.join("my_nodeid");
    match fs::read(&path) {
        Ok(bytes) if bytes.len() == 20 => {
            let mut buf = [0u8; 20];
            buf.copy_from_slice(&bytes);
            Ok(NodeId::new(buf))
        }
        _ => {
            let bytes: [u8; 20] = rand::random();
            fs::write(&path, bytes)?;
            Ok(NodeId::new(bytes))
        }
    }
}

fn build_expirer_config(cmd: &ServeCmd) -> storage_crawler::Result<ExpirerConfig> {
    let mode = match cmd.expiration_mode {
        ExpirationModeArg::Age => {
            let override_duration = cmd.expiration_override_duration.ok_or_else(|| {
                storage_crawler::CrawlerError::InvalidConfig(
                    "--expiration-override-duration is required for --expiration-mode age".into(),
                )
            })?;
            ExpirationMode::Age { override_duration }
        }
        ExpirationModeArg::CutoffDate => {
            let cutoff_date = cmd.expiration_cutoff_date.ok_or_else(|| {
                storage_crawler::CrawlerError::InvalidConfig(
                    "--expiration-cutoff-date is required for --expiration-mode cutoff-date".into(),
                )
            })?;
            ExpirationMode::CutoffDate { cutoff_date }
        }
    };

    let sharetypes: HashSet<ShareTypeFilter> = cmd
        .expiration_sharetypes
        .iter()
        .map(|s| match s {
            ShareTypeArg::Mutable => ShareTypeFilter::Mutable,
            ShareTypeArg::Immutable => ShareTypeFilter::Immutable,
        })
        .collect();

    Ok(ExpirerConfig {
        expiration_enabled: cmd.expiration_enabled,
        mode,
        sharetypes,
    })
}
