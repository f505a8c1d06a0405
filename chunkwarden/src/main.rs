//! chunkwarden - resilience tooling for a content-addressed chunk store
//!
//! This tool provides commands for:
//! - Running orphan detection, cleanup and alias expiry on demand
//! - Running the background resilience workers as a foreground process
//! - Recording renames and resolving old paths
//! - Planning, executing and rolling back chunk migrations
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/chunkwarden/resilience.db (~/.local/share/chunkwarden/resilience.db)
//! - Config: $XDG_CONFIG_HOME/chunkwarden/config.toml (~/.config/chunkwarden/config.toml)
//! - Logs: $XDG_STATE_HOME/chunkwarden/chunkwarden.log

mod render;

use anyhow::{bail, Context, Result};
use chunkwarden_core::{
    Config, Metadata, MigrationStatus, MigrationStrategy, ResilienceStore, ResilienceSystem,
    RiskLevel, StoreChunkUniverse,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "chunkwarden")]
#[command(about = "Keep chunk references resilient: aliases, orphan cleanup, migrations")]
#[command(version)]
struct Args {
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run orphan detection, a bounded cleanup and alias expiry once
    Check,

    /// Show subsystem status and orphan summary
    Status,

    /// Run the background workers until Ctrl+C
    Run {
        /// Stop on its own after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Record and resolve renamed paths
    #[command(subcommand)]
    Alias(AliasCommand),

    /// Plan, execute and roll back chunk migrations
    #[command(subcommand)]
    Migrate(MigrateCommand),
}

#[derive(Subcommand)]
enum AliasCommand {
    /// Record that ORIGINAL now lives at NEW
    Create {
        original: String,
        new: String,

        /// Extra metadata as key=value (repeatable)
        #[arg(long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },

    /// Print the current location of PATH
    Resolve { path: String },

    /// Print the prior paths of the artifact PATH belongs to
    History { path: String },
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Create (and queue) a migration plan
    Plan {
        /// immediate, gradual, batch or intelligent
        #[arg(long)]
        strategy: MigrationStrategy,

        /// low, medium or high
        #[arg(long, default_value = "low")]
        risk: RiskLevel,

        /// Source chunk ids, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        source: Vec<String>,

        /// Target chunk ids, comma separated
        #[arg(long, value_delimiter = ',')]
        target: Vec<String>,

        /// Execute the plan right away instead of leaving it queued
        #[arg(long)]
        execute: bool,
    },

    /// Execute a pending plan now
    Execute { migration_id: String },

    /// Roll back a migration using its stored rollback plan
    Rollback { migration_id: String },

    /// List migration plans
    List {
        /// Only plans with this status
        #[arg(long)]
        status: Option<MigrationStatus>,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Logs go to file so stdout stays clean for command output
    let _log_guard =
        chunkwarden_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let system = open_system(&config)?;

    match args.command {
        Command::Check => cmd_check(&system, args.json),
        Command::Status => cmd_status(&system, args.json),
        Command::Run { duration } => cmd_run(&system, duration, args.json),
        Command::Alias(cmd) => cmd_alias(&system, cmd, args.json),
        Command::Migrate(cmd) => cmd_migrate(&system, cmd, args.json),
    }
}

fn open_system(config: &Config) -> Result<ResilienceSystem> {
    let store_path = config.store_path();
    tracing::info!(path = %store_path.display(), "Opening resilience store");

    let store = ResilienceStore::open(&store_path)
        .with_context(|| format!("failed to open store at {}", store_path.display()))?;
    store.migrate().context("failed to run store migrations")?;
    let store = Arc::new(store);

    let universe = Arc::new(StoreChunkUniverse::new(Arc::clone(&store)));
    ResilienceSystem::new(config.resilience.clone(), store, universe)
        .context("invalid resilience configuration")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_check(system: &ResilienceSystem, json: bool) -> Result<()> {
    let report = system.run_resilience_check();

    if json {
        print_json(&report)?;
    } else {
        render::check_report(&report);
    }

    if !report.is_clean() {
        bail!(
            "resilience check finished with {} failed step(s)",
            report.errors.len()
        );
    }
    Ok(())
}

fn cmd_status(system: &ResilienceSystem, json: bool) -> Result<()> {
    let status = system.get_status();
    if json {
        print_json(&status)
    } else {
        render::status(&status);
        Ok(())
    }
}

fn cmd_run(system: &ResilienceSystem, duration: Option<u64>, json: bool) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    let requeued = system
        .migration_manager()
        .requeue_pending()
        .context("failed to requeue pending migrations")?;

    system.start().context("failed to start resilience workers")?;

    if !json {
        println!("Resilience workers running. Press Ctrl+C to stop.");
        if requeued > 0 {
            println!("Queued {} pending migration(s) from the store.", requeued);
        }
        println!();
    }

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        std::thread::sleep(Duration::from_millis(200));
    }

    // Snapshot before stopping so the report shows uptime
    let status = system.get_status();
    system.stop();

    if json {
        print_json(&status)
    } else {
        render::status(&status);
        Ok(())
    }
}

#[derive(Serialize)]
struct AliasLookup<'a> {
    path: &'a str,
    current_path: Option<String>,
}

#[derive(Serialize)]
struct AliasHistory<'a> {
    path: &'a str,
    history: Vec<String>,
}

fn cmd_alias(system: &ResilienceSystem, cmd: AliasCommand, json: bool) -> Result<()> {
    let aliases = system.alias_manager();

    match cmd {
        AliasCommand::Create {
            original,
            new,
            meta,
        } => {
            let metadata = if meta.is_empty() {
                None
            } else {
                let mut m = Metadata::new();
                for (k, v) in meta {
                    m.insert(k, v);
                }
                Some(m)
            };

            let alias = aliases
                .create_alias(&original, &new, metadata)
                .context("failed to create alias")?;

            if json {
                print_json(&alias)?;
            } else {
                println!("Alias {}", alias.alias_id);
                println!("  {} -> {}", original, alias.current_path);
                println!("  History: {}", alias.version_history.join(" -> "));
            }
        }
        AliasCommand::Resolve { path } => {
            let current_path = aliases
                .resolve_alias(&path)
                .context("failed to resolve alias")?;

            if json {
                print_json(&AliasLookup {
                    path: &path,
                    current_path,
                })?;
            } else {
                match current_path {
                    Some(current) => println!("{}", current),
                    None => println!("No alias for {}", path),
                }
            }
        }
        AliasCommand::History { path } => {
            let history = aliases
                .get_alias_history(&path)
                .context("failed to read alias history")?;

            if json {
                print_json(&AliasHistory {
                    path: &path,
                    history,
                })?;
            } else if history.is_empty() {
                println!("No alias for {}", path);
            } else {
                for (i, p) in history.iter().enumerate() {
                    println!("{:>3}. {}", i + 1, p);
                }
            }
        }
    }

    Ok(())
}

fn cmd_migrate(system: &ResilienceSystem, cmd: MigrateCommand, json: bool) -> Result<()> {
    let migrations = system.migration_manager();

    match cmd {
        MigrateCommand::Plan {
            strategy,
            risk,
            source,
            target,
            execute,
        } => {
            let mut plan = migrations
                .create_migration_plan(strategy, source, target, risk, None)
                .context("failed to create migration plan")?;

            if execute {
                migrations
                    .execute_migration(&mut plan)
                    .context("migration failed")?;
            }

            if json {
                print_json(&plan)?;
            } else {
                render::plan(&plan);
            }
        }
        MigrateCommand::Execute { migration_id } => {
            let mut plan = migrations
                .get_plan(&migration_id)?
                .with_context(|| format!("migration plan not found: {}", migration_id))?;

            let ran = migrations
                .execute_migration(&mut plan)
                .context("migration failed")?;

            if json {
                print_json(&plan)?;
            } else {
                if !ran {
                    println!("Migration {} is {}; nothing to do.", migration_id, plan.status);
                }
                render::plan(&plan);
            }
        }
        MigrateCommand::Rollback { migration_id } => {
            let record = migrations
                .rollback_migration(&migration_id)
                .context("failed to roll back migration")?;

            if json {
                print_json(&record)?;
            } else {
                render::rollback(&record);
            }

            if !record.success {
                bail!(
                    "rollback of {} did not complete: {}",
                    migration_id,
                    record.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }
        MigrateCommand::List { status } => {
            let plans = migrations
                .list_plans(status)
                .context("failed to list migration plans")?;

            if json {
                print_json(&plans)?;
            } else {
                render::plan_table(&plans);
            }
        }
    }

    Ok(())
}
