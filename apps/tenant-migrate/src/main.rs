//! `tenant-migrate`: apply a migration plan to every tenant schema.
//!
//! # Usage
//!
//! ```bash
//! # Apply a plan to public and every tenant_* schema
//! tenant-migrate run --plan plans/patient-flags.yaml
//!
//! # What would change, for one clinic only
//! tenant-migrate plan --plan plans/patient-flags.yaml --tenant miami
//!
//! # Machine-readable report, partial success allowed
//! tenant-migrate --json --lenient run --plan plans/appointment-status.yaml
//! ```
//!
//! Exit codes: 0 success, 1 at least one tenant failed (strict policy),
//! 2 configuration, plan or connectivity error.

// CLI tools are expected to print to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod logging;
mod output;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tenant_migrate::config::describe_target;
use tenant_migrate::{ExitPolicy, LogFormat, MigrateConfig, MigrationDriver, MigrationPlan, PgStore};

const EXIT_TENANT_FAILED: u8 = 1;
const EXIT_FATAL: u8 = 2;

/// Multi-tenant schema migration runner
///
/// Discovers tenant schemas and applies an idempotent migration plan to
/// each of them in its own transaction.
#[derive(Parser)]
#[command(name = "tenant-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Only migrate this tenant (schema name or registry identifier)
    #[arg(long, global = true)]
    tenant: Option<String>,

    /// Tenants migrated at the same time (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Print the report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Exit 0 even if some tenants failed
    #[arg(long, global = true)]
    lenient: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log line format on stderr (overrides config)
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a plan to every discovered tenant
    Run {
        /// Migration plan (YAML)
        #[arg(short, long)]
        plan: PathBuf,

        /// Report pending steps without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Create registry-listed schemas that do not exist yet
        #[arg(long)]
        create_schemas: bool,
    },
    /// Show which steps a plan would apply to each tenant
    Plan {
        /// Migration plan (YAML)
        #[arg(short, long)]
        plan: PathBuf,
    },
    /// List the tenant schemas a run would visit
    Discover,
    /// Validate configuration (and a plan) and print the effective configuration
    Check {
        /// Migration plan (YAML) to validate as well
        #[arg(short, long)]
        plan: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // A missing .env file is not an error.
    _ = dotenvy::dotenv();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    logging::init(config.logging.format, cli.verbose, &config.logging.level);

    match &cli.command {
        Commands::Check { plan } => check(&config, plan.as_deref(), cli.json),
        Commands::Discover => discover(&config, cli.json).await,
        Commands::Run { plan, .. } | Commands::Plan { plan } => apply(&config, plan, cli.json).await,
    }
}

/// Layered config:
/// 1) defaults -> 2) YAML (if provided) -> 3) env -> 4) CLI overrides
fn load_config(cli: &Cli) -> Result<MigrateConfig> {
    let mut config = MigrateConfig::load(cli.config.as_deref())?;

    if let Some(tenant) = &cli.tenant {
        config.runner.tenant = Some(tenant.clone());
    }
    if let Some(concurrency) = cli.concurrency {
        config.runner.concurrency = concurrency;
    }
    if cli.lenient {
        config.runner.exit_policy = ExitPolicy::Lenient;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = match format {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        };
    }
    match &cli.command {
        Commands::Run {
            dry_run,
            create_schemas,
            ..
        } => {
            config.runner.dry_run |= *dry_run;
            config.runner.create_schemas |= *create_schemas;
        }
        Commands::Plan { .. } => config.runner.dry_run = true,
        Commands::Discover | Commands::Check { .. } => {}
    }

    config.validate()?;
    Ok(config)
}

async fn apply(config: &MigrateConfig, plan_path: &Path, json: bool) -> Result<ExitCode> {
    // Plan problems are fatal before any tenant is touched.
    let plan = MigrationPlan::from_path(plan_path)?;
    let policy = config.runner.exit_policy;

    let store = PgStore::connect(&config.database, config.pool_size()).await?;
    let driver = MigrationDriver::new(Arc::new(store.clone()), config);

    if !json {
        let mode = if config.runner.dry_run { " (dry run)" } else { "" };
        println!("Applying plan '{}'{mode}", plan.name.bold());
    }
    let result = driver
        .run_with_progress(&plan, |outcome| {
            if !json {
                output::print_progress(outcome);
            }
        })
        .await;
    store.close().await;
    let report = result?;

    if json {
        output::print_json(&report)?;
    } else {
        output::print_summary(&report, policy);
    }

    if report.is_success(policy) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_TENANT_FAILED))
    }
}

async fn discover(config: &MigrateConfig, json: bool) -> Result<ExitCode> {
    let store = PgStore::connect(&config.database, config.pool_size()).await?;
    let driver = MigrationDriver::new(Arc::new(store.clone()), config);
    let result = driver.discover().await;
    store.close().await;
    let discovery = result?;

    if json {
        output::print_json(&discovery)?;
    } else {
        output::print_discovery(&discovery);
    }
    Ok(ExitCode::SUCCESS)
}

fn check(config: &MigrateConfig, plan_path: Option<&Path>, json: bool) -> Result<ExitCode> {
    tracing::info!("Checking configuration...");
    let target = describe_target(
        &config
            .database
            .connect_options()
            .context("invalid database settings")?,
    );
    let plan = plan_path.map(MigrationPlan::from_path).transpose()?;

    if json {
        output::print_json(&serde_json::json!({
            "ok": true,
            "database": target,
            "config": config.redacted(),
            "plan": plan.as_ref().map(|p| serde_json::json!({
                "name": p.name,
                "steps": p.step_names(),
            })),
        }))?;
        return Ok(ExitCode::SUCCESS);
    }

    println!("Configuration is valid");
    println!("Database: {target}");
    if let Some(plan) = &plan {
        println!(
            "Plan '{}' is valid ({} steps: {})",
            plan.name,
            plan.steps.len(),
            plan.step_names().join(", ")
        );
    }
    output::print_json(&config.redacted())?;
    Ok(ExitCode::SUCCESS)
}
