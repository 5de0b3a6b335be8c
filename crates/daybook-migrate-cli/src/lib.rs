//! Operator command surface for the daybook schema migration engine.
//!
//! The application's startup path and operators share the same entrypoints:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_schema`] for direct `SchemaCommand` execution against a DB path.
//!
//! On success the rest of the application may open the store and rely on the
//! target schema; on error it must not proceed against the store.

#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use daybook_migrate_core::{SchemaVersion, StepMeta};
use daybook_store_sqlite::{schema_registry, MigrationRunner, UpgradeReport, VersionedStore};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "dbk")]
#[command(about = "Daybook schema migration CLI")]
pub struct Cli {
    #[arg(long, default_value = "./daybook.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Schema {
        #[command(subcommand)]
        command: Box<SchemaCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    Status(StatusArgs),
    Upgrade(UpgradeArgs),
    Steps(StepsArgs),
    Check,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct UpgradeArgs {
    /// Target schema version; defaults to the highest registered version.
    #[arg(long)]
    to: Option<SchemaVersion>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct StepsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct SchemaStatus {
    current_version: SchemaVersion,
    latest_version: SchemaVersion,
    pending_steps: usize,
}

#[derive(Debug, Serialize)]
struct StepListing {
    from_version: SchemaVersion,
    to_version: SchemaVersion,
    summary: String,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Schema { command } => run_schema(*command, &cli.db),
    }
}

pub fn run_schema(command: SchemaCommand, db_path: &Path) -> Result<()> {
    let registry = schema_registry()?;

    match command {
        SchemaCommand::Status(args) => {
            let store = VersionedStore::open(db_path)?;
            let current_version = store.current_version()?;
            let latest_version = registry.latest_version();
            let pending_steps = registry.chain_from(current_version, latest_version)?.len();

            let status = SchemaStatus {
                current_version,
                latest_version,
                pending_steps,
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "current_version={} latest_version={} pending_steps={}",
                    status.current_version, status.latest_version, status.pending_steps
                );
            }
            Ok(())
        }
        SchemaCommand::Upgrade(args) => {
            let runner = MigrationRunner::new(registry);
            let mut store = VersionedStore::open(db_path)?;
            let report = match args.to {
                Some(target) => runner.upgrade(&mut store, target)?,
                None => runner.upgrade_to_latest(&mut store)?,
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_upgrade_report(&report);
            }
            Ok(())
        }
        SchemaCommand::Steps(args) => {
            let listings: Vec<StepListing> = registry
                .steps()
                .map(|step| StepListing {
                    from_version: step.from_version(),
                    to_version: step.to_version(),
                    summary: step.summary().to_string(),
                })
                .collect();

            if args.json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else {
                print_step_listings(&listings);
            }
            Ok(())
        }
        SchemaCommand::Check => {
            let latest_version = registry.latest_version();
            let chain = registry.chain_from(0, latest_version)?;
            println!(
                "registered chain is contiguous: 0 -> {latest_version} ({} steps)",
                chain.len()
            );
            Ok(())
        }
    }
}

fn print_upgrade_report(report: &UpgradeReport) {
    println!(
        "upgraded from version {} to {} ({} steps applied)",
        report.from_version,
        report.to_version,
        report.applied.len()
    );
    for step in &report.applied {
        println!(
            "  {} -> {}: {}",
            step.from_version, step.to_version, step.summary
        );
    }
}

fn print_step_listings(listings: &[StepListing]) {
    println!("{:<6} {:<6} summary", "from", "to");
    println!("{}", "-".repeat(72));
    for listing in listings {
        println!(
            "{:<6} {:<6} {}",
            listing.from_version, listing.to_version, listing.summary
        );
    }
}
