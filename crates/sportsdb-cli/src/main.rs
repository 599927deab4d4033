//! sportsdb migration command-line tool.
//!
//! Applies, reverts and inspects the sportsdb schema migration chain.

mod commands;
mod formatter;

use clap::{Args, Parser, Subcommand};
use formatter::OutputFormat;
use sportsdb::MigrationConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// sportsdb schema migration and repair
#[derive(Parser, Debug)]
#[command(name = "sportsdb-migrate")]
#[command(version, about = "Schema migration and repair for the sportsdb database")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migration steps
    Run(RunArgs),
    /// Show applied and pending steps
    Status(StatusArgs),
    /// Revert the most recently applied step
    Revert(RevertArgs),
    /// Run read-only integrity checks
    Check(CheckArgs),
    /// List snapshots in a backup directory
    Backups(BackupsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Database file
    #[arg(long)]
    pub db: PathBuf,

    /// Check prerequisites only; nothing is written to the database
    #[arg(long)]
    pub dry_run: bool,

    /// Snapshot directory (defaults to <db dir>/backups)
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Stop after this step
    #[arg(long)]
    pub target: Option<String>,

    /// Run artifact path (defaults to <db dir>/migration_results.json)
    #[arg(long)]
    pub results: Option<PathBuf>,

    /// Do not write the run artifact
    #[arg(long)]
    pub no_results: bool,

    /// Gzip snapshots
    #[arg(long)]
    pub compress: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Database file
    #[arg(long)]
    pub db: PathBuf,
}

#[derive(Args, Debug)]
pub struct RevertArgs {
    /// Database file
    #[arg(long)]
    pub db: PathBuf,

    /// Report which step would be reverted
    #[arg(long)]
    pub dry_run: bool,

    /// Snapshot directory (defaults to <db dir>/backups)
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Gzip snapshots
    #[arg(long)]
    pub compress: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Database file
    #[arg(long)]
    pub db: PathBuf,

    /// Season for the membership orphan scan
    #[arg(long)]
    pub season: Option<i64>,
}

#[derive(Args, Debug)]
pub struct BackupsArgs {
    /// Snapshot directory
    #[arg(long)]
    pub backup_dir: PathBuf,

    /// Recompute each snapshot's checksum
    #[arg(long)]
    pub verify: bool,
}

impl From<&RunArgs> for MigrationConfig {
    fn from(args: &RunArgs) -> Self {
        let mut config = MigrationConfig::new(&args.db)
            .with_dry_run(args.dry_run)
            .with_compression(args.compress)
            .with_results(!args.no_results);
        if let Some(dir) = &args.backup_dir {
            config = config.with_backup_dir(dir);
        }
        if let Some(path) = &args.results {
            config = config.with_results_path(path);
        }
        config
    }
}

impl From<&RevertArgs> for MigrationConfig {
    fn from(args: &RevertArgs) -> Self {
        let mut config = MigrationConfig::new(&args.db)
            .with_dry_run(args.dry_run)
            .with_compression(args.compress);
        if let Some(dir) = &args.backup_dir {
            config = config.with_backup_dir(dir);
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sportsdb=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match commands::execute(&cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
