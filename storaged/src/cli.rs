use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Storage-server daemon and crawler-state migration CLI.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enables debug-level logging (`env_logger` via `RUST_LOG` still wins
    /// if set).
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the storage server and its background lease-expiring crawler
    /// until interrupted.
    Serve(ServeCmd),
    /// Converts a legacy pickled crawler state file to the current JSON
    /// format, in place.
    MigrateCrawlerState(MigrateCmd),
}

#[derive(Parser, Debug)]
pub struct ServeCmd {
    /// Directory shares, lease-checker state and corruption advisories are
    /// stored under.
    pub basedir: PathBuf,

    /// Bytes of free disk space this server refuses to dip below
    /// (SPEC_FULL.md §1, component F).
    #[arg(long, default_value_t = 0)]
    pub reserved_space: u64,

    /// Rejects new share allocations and mutable writes; reads and lease
    /// renewals are still served.
    #[arg(long)]
    pub readonly: bool,

    /// Enables the lease-expirer actually deleting shares. Without this,
    /// the crawler still runs and still histograms lease ages, but never
    /// removes anything (spec.md §4.H).
    #[arg(long)]
    pub expiration_enabled: bool,

    /// Which expiry policy the crawler evaluates shares against.
    #[arg(long, value_enum, default_value_t = ExpirationModeArg::Age)]
    pub expiration_mode: ExpirationModeArg,

    /// Required when `--expiration-mode age`: seconds since a lease was
    /// last renewed before it's considered expired.
    #[arg(long)]
    pub expiration_override_duration: Option<u32>,

    /// Required when `--expiration-mode cutoff-date`: a Unix timestamp;
    /// leases last renewed before it are considered expired.
    #[arg(long)]
    pub expiration_cutoff_date: Option<u32>,

    /// Share kinds the lease-expirer is allowed to delete. Defaults to
    /// both if omitted.
    #[arg(long, value_enum, num_args = 1.., default_values_t = [ShareTypeArg::Mutable, ShareTypeArg::Immutable])]
    pub expiration_sharetypes: Vec<ShareTypeArg>,
}

#[derive(ValueEnum, Copy, Clone, Debug)]
pub enum ExpirationModeArg {
    Age,
    CutoffDate,
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShareTypeArg {
    Mutable,
    Immutable,
}

#[derive(Parser, Debug)]
pub struct MigrateCmd {
    /// Path to a `lease_checker.state` (or `.history`) file. Left alone if
    /// it's already JSON; a legacy pickle file is rewritten in place as its
    /// JSON equivalent (spec.md §4.H/§4.J).
    pub state_path: PathBuf,
}
