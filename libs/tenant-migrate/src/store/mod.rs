//! Storage seam between the runner and the database.
//!
//! [`TenantStore`] answers catalog questions and opens one transaction per
//! tenant; [`TenantTx`] performs everything the applier needs inside that
//! transaction. Every call names its schema explicitly, so no session state
//! such as `search_path` is ever relied on.
//!
//! Two backends exist: [`postgres::PgStore`] over an `sqlx` pool and
//! [`memory::InMemoryStore`] for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::RegistryConfig;
use crate::ident::Ident;
use crate::plan::Change;

pub mod memory;
pub mod postgres;
pub mod sql;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The database is unreachable or the connection dropped.
    #[error("database connection failed: {message}")]
    Connection { message: String },

    /// A statement failed inside a tenant transaction.
    #[error("statement failed in schema '{schema}': {message}")]
    Statement { schema: String, message: String },

    /// A catalog or registry query failed.
    #[error("catalog query failed: {message}")]
    Catalog { message: String },
}

impl StoreError {
    /// Whether the error means the database itself is gone, as opposed to
    /// one tenant's statement failing.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// One row of the tenant registry table, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRow {
    pub id: Option<String>,
    pub schema: Option<String>,
    pub status: Option<String>,
}

impl RegistryRow {
    #[must_use]
    pub fn new(id: &str, schema: &str, status: Option<&str>) -> Self {
        Self {
            id: Some(id.to_owned()),
            schema: Some(schema.to_owned()),
            status: status.map(str::to_owned),
        }
    }
}

/// Catalog access plus per-tenant transactions.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Names of all schemas in the database, sorted.
    async fn list_schemas(&self) -> Result<Vec<String>, StoreError>;

    /// All rows of the registry table, unfiltered.
    async fn list_registry(&self, registry: &RegistryConfig)
    -> Result<Vec<RegistryRow>, StoreError>;

    /// Open a transaction dedicated to `schema`.
    async fn begin(&self, schema: &Ident) -> Result<Box<dyn TenantTx>, StoreError>;
}

/// A transaction bound to one tenant schema.
///
/// Dropping it without calling [`TenantTx::commit`] rolls it back.
#[async_trait]
pub trait TenantTx: Send {
    fn schema(&self) -> &Ident;

    /// `CREATE SCHEMA IF NOT EXISTS`
    async fn ensure_schema(&mut self) -> Result<(), StoreError>;

    async fn table_exists(&mut self, table: &Ident) -> Result<bool, StoreError>;

    /// Create the ledger table in this schema if it is missing.
    async fn ensure_ledger(&mut self, ledger: &Ident) -> Result<(), StoreError>;

    /// Applied step names mapped to their checksums.
    async fn ledger_entries(&mut self, ledger: &Ident)
    -> Result<HashMap<String, String>, StoreError>;

    async fn record(&mut self, ledger: &Ident, step: &str, checksum: &str)
    -> Result<(), StoreError>;

    /// Execute one change against this schema.
    async fn execute(&mut self, change: &Change) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
