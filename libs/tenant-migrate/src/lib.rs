#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Schema migrations for schema-per-tenant Postgres databases.
//!
//! A [`MigrationPlan`] is an ordered list of idempotent structural changes.
//! The [`MigrationDriver`] discovers tenant schemas once, then applies the
//! plan to each tenant in its own transaction:
//!
//! - every statement names the tenant schema explicitly (no `search_path`)
//! - each tenant keeps a ledger of applied steps, and the DDL itself is
//!   conditional (`IF NOT EXISTS`), so re-running a plan changes nothing
//! - a failing tenant is rolled back and reported; the others continue
//! - losing the database connection aborts the whole run
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenant_migrate::{MigrateConfig, MigrationDriver, MigrationPlan, PgStore};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = MigrateConfig::load(None)?;
//! let plan = MigrationPlan::from_path("plans/patient-flags.yaml".as_ref())?;
//! let store = PgStore::connect(&config.database, config.pool_size()).await?;
//!
//! let driver = MigrationDriver::new(Arc::new(store), &config);
//! let report = driver.run(&plan).await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod applier;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod ident;
pub mod plan;
pub mod report;
pub mod store;

pub use applier::{ApplyOptions, apply_tenant};
pub use config::{ConfigError, ExitPolicy, LogFormat, MigrateConfig};
pub use discovery::{Discovery, DiscoveryError, Tenant, TenantSource};
pub use driver::{MigrationDriver, RunError, RunPhase};
pub use ident::{Ident, IdentError};
pub use plan::{Change, MigrationPlan, MigrationStep, PlanError};
pub use report::{RunReport, TenantOutcome, TenantStatus, Totals};
pub use store::memory::InMemoryStore;
pub use store::postgres::{PgConnectError, PgStore};
pub use store::{RegistryRow, StoreError, TenantStore, TenantTx};
