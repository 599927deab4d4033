//! Subcommand handlers.
//!
//! Each handler prints its output and returns whether the command succeeded.

use crate::formatter::{self, OutputFormat};
use crate::{BackupsArgs, CheckArgs, Cli, Command, RevertArgs, RunArgs, StatusArgs};
use serde::Serialize;
use sportsdb::sportsdb_backup::{BackupConfig, BackupManager};
use sportsdb::{MigrationConfig, MigrationRunner, RunOutcome};
use tracing::warn;

type CommandResult = Result<bool, Box<dyn std::error::Error>>;

/// Dispatch a parsed command line.
pub fn execute(cli: &Cli) -> CommandResult {
    match &cli.command {
        Command::Run(args) => run(args, cli.format),
        Command::Status(args) => status(args, cli.format),
        Command::Revert(args) => revert(args, cli.format),
        Command::Check(args) => check(args, cli.format),
        Command::Backups(args) => backups(args, cli.format),
    }
}

fn run(args: &RunArgs, format: OutputFormat) -> CommandResult {
    let runner = MigrationRunner::new(MigrationConfig::from(args))?;
    let outcome = runner.run(args.target.as_deref());
    print_outcome(&outcome, format)
}

fn revert(args: &RevertArgs, format: OutputFormat) -> CommandResult {
    let runner = MigrationRunner::new(MigrationConfig::from(args))?;
    let outcome = runner.revert();
    print_outcome(&outcome, format)
}

fn status(args: &StatusArgs, format: OutputFormat) -> CommandResult {
    let runner = MigrationRunner::new(MigrationConfig::new(&args.db))?;
    let status = runner.status()?;
    match format {
        OutputFormat::Table => println!("{}", formatter::format_status(&status)),
        OutputFormat::Json => print_json(&status)?,
    }
    Ok(true)
}

fn check(args: &CheckArgs, format: OutputFormat) -> CommandResult {
    let runner = MigrationRunner::new(MigrationConfig::new(&args.db))?;
    let report = runner.check(args.season)?;
    match format {
        OutputFormat::Table => println!("{}", formatter::format_check(&report)),
        OutputFormat::Json => print_json(&report)?,
    }
    Ok(report.passed())
}

fn backups(args: &BackupsArgs, format: OutputFormat) -> CommandResult {
    let manager = BackupManager::new(BackupConfig::new(&args.backup_dir));
    let handles = manager.list()?;

    let verified: Option<Vec<bool>> = args.verify.then(|| {
        handles
            .iter()
            .map(|h| match manager.verify(h) {
                Ok(()) => true,
                Err(e) => {
                    warn!(backup = %h.id, error = %e, "Snapshot failed verification");
                    false
                }
            })
            .collect()
    });
    let all_ok = verified.as_ref().map_or(true, |v| v.iter().all(|ok| *ok));

    match format {
        OutputFormat::Table => println!(
            "{}",
            formatter::format_backups(&handles, verified.as_deref())
        ),
        OutputFormat::Json => print_json(&handles)?,
    }
    Ok(all_ok)
}

fn print_outcome(outcome: &RunOutcome, format: OutputFormat) -> CommandResult {
    match format {
        OutputFormat::Table => println!("{}", formatter::format_run(&outcome.artifact)),
        OutputFormat::Json => print_json(&outcome.artifact)?,
    }
    if let Some(e) = &outcome.error {
        eprintln!("Error: {}", e);
    }
    Ok(outcome.succeeded())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
