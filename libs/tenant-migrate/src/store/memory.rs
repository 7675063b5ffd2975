//! In-memory store with Postgres-like DDL semantics and fault injection.
//!
//! Each transaction works on a copy of its schema taken at `begin` and
//! writes it back on commit, so a rolled-back or dropped transaction leaves
//! nothing behind. Statements are rendered with the same SQL builders as the
//! Postgres backend and kept in a log of committed statements.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RegistryRow, StoreError, TenantStore, TenantTx, sql};
use crate::config::RegistryConfig;
use crate::ident::Ident;
use crate::plan::Change;

/// Tables, indexes and ledgers of one schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaState {
    /// Table name to column names.
    pub tables: BTreeMap<String, BTreeSet<String>>,
    pub indexes: BTreeSet<String>,
    /// Ledger table name to step name to checksum.
    pub ledgers: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
struct Fault {
    schema: String,
    needle: String,
    message: String,
}

#[derive(Debug, Default)]
struct Inner {
    schemas: BTreeMap<String, SchemaState>,
    registry: Vec<RegistryRow>,
    faults: Vec<Fault>,
    offline: bool,
    disconnect_on: HashSet<String>,
    delays: HashMap<String, Duration>,
    statements: Vec<String>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Shared handle; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_schema(&self, schema: &str) {
        self.inner
            .lock()
            .schemas
            .entry(schema.to_owned())
            .or_default();
    }

    /// Create `schema` if needed and a table in it.
    pub fn add_table(&self, schema: &str, table: &str, columns: &[&str]) {
        let mut inner = self.inner.lock();
        let state = inner.schemas.entry(schema.to_owned()).or_default();
        state.tables.insert(
            table.to_owned(),
            columns.iter().map(|c| (*c).to_owned()).collect(),
        );
    }

    pub fn add_registry_row(&self, row: RegistryRow) {
        self.inner.lock().registry.push(row);
    }

    /// Fail any statement in `schema` whose SQL contains `needle`.
    pub fn fail_when(&self, schema: &str, needle: &str, message: &str) {
        self.inner.lock().faults.push(Fault {
            schema: schema.to_owned(),
            needle: needle.to_owned(),
            message: message.to_owned(),
        });
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Every call fails with a connection error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Statements in `schema` fail as if the connection had dropped.
    pub fn disconnect_on(&self, schema: &str) {
        self.inner.lock().disconnect_on.insert(schema.to_owned());
    }

    /// Sleep this long before each change executed in `schema`.
    pub fn delay_on(&self, schema: &str, delay: Duration) {
        self.inner.lock().delays.insert(schema.to_owned(), delay);
    }

    #[must_use]
    pub fn snapshot(&self, schema: &str) -> Option<SchemaState> {
        self.inner.lock().schemas.get(schema).cloned()
    }

    #[must_use]
    pub fn has_schema(&self, schema: &str) -> bool {
        self.inner.lock().schemas.contains_key(schema)
    }

    #[must_use]
    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.inner
            .lock()
            .schemas
            .get(schema)
            .is_some_and(|s| s.tables.contains_key(table))
    }

    #[must_use]
    pub fn has_column(&self, schema: &str, table: &str, column: &str) -> bool {
        self.inner
            .lock()
            .schemas
            .get(schema)
            .and_then(|s| s.tables.get(table))
            .is_some_and(|cols| cols.contains(column))
    }

    #[must_use]
    pub fn has_index(&self, schema: &str, index: &str) -> bool {
        self.inner
            .lock()
            .schemas
            .get(schema)
            .is_some_and(|s| s.indexes.contains(index))
    }

    /// Step names recorded in `schema`'s ledger, sorted.
    #[must_use]
    pub fn ledger(&self, schema: &str, ledger: &str) -> Vec<String> {
        self.inner
            .lock()
            .schemas
            .get(schema)
            .and_then(|s| s.ledgers.get(ledger))
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Overwrite a ledger checksum, as if the step had been edited since.
    pub fn tamper_ledger(&self, schema: &str, ledger: &str, step: &str, checksum: &str) {
        let mut inner = self.inner.lock();
        if let Some(rows) = inner
            .schemas
            .get_mut(schema)
            .and_then(|s| s.ledgers.get_mut(ledger))
        {
            rows.insert(step.to_owned(), checksum.to_owned());
        }
    }

    /// Committed statements, in commit order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.inner.lock().statements.clone()
    }

    /// Most tenant transactions that were open at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.inner.lock().peak_in_flight
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.inner.lock().offline {
            return Err(StoreError::Connection {
                message: "connection refused".to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for InMemoryStore {
    async fn list_schemas(&self) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        Ok(self
            .inner
            .lock()
            .schemas
            .keys()
            .filter(|name| !name.starts_with("pg_") && *name != "information_schema")
            .cloned()
            .collect())
    }

    async fn list_registry(
        &self,
        registry: &RegistryConfig,
    ) -> Result<Vec<RegistryRow>, StoreError> {
        self.check_online()?;
        let inner = self.inner.lock();
        let registry_exists = inner
            .schemas
            .get(registry.schema.as_str())
            .is_some_and(|s| s.tables.contains_key(registry.table.as_str()));
        if !registry_exists {
            return Err(StoreError::Catalog {
                message: format!(
                    "relation {} does not exist",
                    registry.schema.qualify(&registry.table)
                ),
            });
        }
        let mut rows = inner.registry.clone();
        rows.sort_by(|a, b| a.schema.cmp(&b.schema));
        Ok(rows)
    }

    async fn begin(&self, schema: &Ident) -> Result<Box<dyn TenantTx>, StoreError> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.in_flight += 1;
        inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
        let working = inner.schemas.get(schema.as_str()).cloned();
        drop(inner);

        Ok(Box::new(MemoryTx {
            store: self.inner.clone(),
            schema: schema.clone(),
            working,
            statements: Vec::new(),
        }))
    }
}

struct MemoryTx {
    store: Arc<Mutex<Inner>>,
    schema: Ident,
    /// `None` while the schema does not exist.
    working: Option<SchemaState>,
    statements: Vec<String>,
}

impl MemoryTx {
    fn statement_error(&self, message: String) -> StoreError {
        StoreError::Statement {
            schema: self.schema.to_string(),
            message,
        }
    }

    fn state_mut(&mut self) -> Result<&mut SchemaState, StoreError> {
        let schema = &self.schema;
        self.working.as_mut().ok_or_else(|| StoreError::Statement {
            schema: schema.to_string(),
            message: format!("schema {} does not exist", schema.quoted()),
        })
    }

    fn missing_relation(&self, table: &Ident) -> StoreError {
        self.statement_error(format!(
            "relation {} does not exist",
            self.schema.qualify(table)
        ))
    }

    /// Injected faults and connection drops for `statement`.
    fn check_faults(&self, statement: &str) -> Result<(), StoreError> {
        let inner = self.store.lock();
        if inner.offline || inner.disconnect_on.contains(self.schema.as_str()) {
            return Err(StoreError::Connection {
                message: "server closed the connection unexpectedly".to_owned(),
            });
        }
        let fault = inner
            .faults
            .iter()
            .find(|f| f.schema == self.schema.as_str() && statement.contains(&f.needle));
        match fault {
            Some(fault) => Err(self.statement_error(fault.message.clone())),
            None => Ok(()),
        }
    }

    fn apply(&mut self, change: &Change) -> Result<(), StoreError> {
        match change {
            Change::AddColumn { table, column, .. } => {
                let missing = self.missing_relation(table);
                let state = self.state_mut()?;
                let columns = state.tables.get_mut(table.as_str()).ok_or(missing)?;
                columns.insert(column.to_string());
            }
            Change::CreateTable { table, columns } => {
                let names = columns.iter().filter_map(|c| column_name(c)).collect();
                let state = self.state_mut()?;
                state.tables.entry(table.to_string()).or_insert(names);
            }
            Change::CreateIndex { index, table, .. } => {
                let missing = self.missing_relation(table);
                let state = self.state_mut()?;
                if !state.tables.contains_key(table.as_str()) {
                    return Err(missing);
                }
                state.indexes.insert(index.to_string());
            }
            // Opaque to this store; only the fault hooks see it.
            Change::Sql { .. } => {
                self.state_mut()?;
            }
        }
        Ok(())
    }
}

/// Column name of a `create_table` entry, `None` for table constraints.
fn column_name(entry: &str) -> Option<String> {
    let first = entry.split_whitespace().next()?;
    let keyword = first.to_ascii_uppercase();
    if matches!(
        keyword.as_str(),
        "PRIMARY" | "UNIQUE" | "CONSTRAINT" | "FOREIGN" | "CHECK" | "EXCLUDE"
    ) {
        return None;
    }
    Some(first.trim_matches('"').to_owned())
}

#[async_trait]
impl TenantTx for MemoryTx {
    fn schema(&self) -> &Ident {
        &self.schema
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        let statement = sql::create_schema(&self.schema);
        self.check_faults(&statement)?;
        if self.working.is_none() {
            self.working = Some(SchemaState::default());
        }
        self.statements.push(statement);
        Ok(())
    }

    async fn table_exists(&mut self, table: &Ident) -> Result<bool, StoreError> {
        Ok(self
            .working
            .as_ref()
            .is_some_and(|s| s.tables.contains_key(table.as_str())))
    }

    async fn ensure_ledger(&mut self, ledger: &Ident) -> Result<(), StoreError> {
        let statement = sql::create_ledger(&self.schema, ledger);
        self.check_faults(&statement)?;
        let state = self.state_mut()?;
        state.tables.entry(ledger.to_string()).or_insert_with(|| {
            ["name", "checksum", "applied_at"]
                .into_iter()
                .map(str::to_owned)
                .collect()
        });
        state.ledgers.entry(ledger.to_string()).or_default();
        self.statements.push(statement);
        Ok(())
    }

    async fn ledger_entries(
        &mut self,
        ledger: &Ident,
    ) -> Result<HashMap<String, String>, StoreError> {
        let missing = self.missing_relation(ledger);
        let state = self.state_mut()?;
        let rows = state.ledgers.get(ledger.as_str()).ok_or(missing)?;
        Ok(rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn record(
        &mut self,
        ledger: &Ident,
        step: &str,
        checksum: &str,
    ) -> Result<(), StoreError> {
        let statement = sql::insert_ledger(&self.schema, ledger);
        self.check_faults(&statement)?;
        let missing = self.missing_relation(ledger);
        let duplicate = self.statement_error(format!(
            "duplicate key value violates unique constraint on {ledger}: {step}"
        ));
        let state = self.state_mut()?;
        let rows = state.ledgers.get_mut(ledger.as_str()).ok_or(missing)?;
        if rows.contains_key(step) {
            return Err(duplicate);
        }
        rows.insert(step.to_owned(), checksum.to_owned());
        self.statements.push(format!("{statement} -- {step}"));
        Ok(())
    }

    async fn execute(&mut self, change: &Change) -> Result<(), StoreError> {
        let statement = sql::render_change(&self.schema, change);
        let delay = self.store.lock().delays.get(self.schema.as_str()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_faults(&statement)?;
        self.apply(change)?;
        self.statements.push(statement);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        if inner.offline {
            return Err(StoreError::Connection {
                message: "connection lost during commit".to_owned(),
            });
        }
        if let Some(state) = self.working.take() {
            inner.schemas.insert(self.schema.to_string(), state);
        }
        inner.statements.append(&mut self.statements);
        drop(inner);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        let mut inner = self.store.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }
}
