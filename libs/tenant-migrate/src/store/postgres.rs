//! Postgres backend over an `sqlx` pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, Transaction};
use tracing::{debug, info};

use super::{RegistryRow, StoreError, TenantStore, TenantTx, sql};
use crate::config::{ConfigError, DatabaseConfig, RegistryConfig, describe_target};
use crate::ident::Ident;
use crate::plan::Change;

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled Postgres store. One pooled connection serves discovery; each
/// tenant transaction holds another for its lifetime.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a pool with `max_conns` connections and verify connectivity.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for unusable connection settings and
    /// [`StoreError::Connection`] (wrapped in `PgConnectError`) when the
    /// server cannot be reached.
    pub async fn connect(db: &DatabaseConfig, max_conns: u32) -> Result<Self, PgConnectError> {
        let opts = db.connect_options()?;
        let target = describe_target(&opts);
        debug!(db = %target, max_conns, "connecting to postgres");

        let pool = PgPoolOptions::new()
            .max_connections(max_conns)
            .acquire_timeout(db.acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT))
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::Connection {
                message: format!("{target}: {e}"),
            })?;

        info!(db = %target, "connected");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Why [`PgStore::connect`] failed.
#[derive(Debug, thiserror::Error)]
pub enum PgConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
impl TenantStore for PgStore {
    async fn list_schemas(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(sql::LIST_SCHEMAS)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| catalog_error(&e))
    }

    async fn list_registry(
        &self,
        registry: &RegistryConfig,
    ) -> Result<Vec<RegistryRow>, StoreError> {
        let query = sql::select_registry(registry);
        let rows =
            sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>)>(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| catalog_error(&e))?;

        Ok(rows
            .into_iter()
            .map(|(id, schema, status)| RegistryRow { id, schema, status })
            .collect())
    }

    async fn begin(&self, schema: &Ident) -> Result<Box<dyn TenantTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| statement_error(schema, &e))?;
        Ok(Box::new(PgTenantTx {
            schema: schema.clone(),
            tx,
        }))
    }
}

struct PgTenantTx {
    schema: Ident,
    tx: Transaction<'static, Postgres>,
}

impl PgTenantTx {
    async fn run(&mut self, statement: &str) -> Result<(), StoreError> {
        debug!(schema = %self.schema, sql = statement, "executing");
        let conn: &mut PgConnection = &mut self.tx;
        Executor::execute(conn, sqlx::raw_sql(statement))
            .await
            .map_err(|e| statement_error(&self.schema, &e))?;
        Ok(())
    }
}

#[async_trait]
impl TenantTx for PgTenantTx {
    fn schema(&self) -> &Ident {
        &self.schema
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        let statement = sql::create_schema(&self.schema);
        self.run(&statement).await
    }

    async fn table_exists(&mut self, table: &Ident) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(sql::TABLE_EXISTS)
            .bind(self.schema.qualify(table))
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| statement_error(&self.schema, &e))
    }

    async fn ensure_ledger(&mut self, ledger: &Ident) -> Result<(), StoreError> {
        let statement = sql::create_ledger(&self.schema, ledger);
        self.run(&statement).await
    }

    async fn ledger_entries(
        &mut self,
        ledger: &Ident,
    ) -> Result<HashMap<String, String>, StoreError> {
        let query = sql::select_ledger(&self.schema, ledger);
        let rows = sqlx::query_as::<_, (String, String)>(&query)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| statement_error(&self.schema, &e))?;
        Ok(rows.into_iter().collect())
    }

    async fn record(
        &mut self,
        ledger: &Ident,
        step: &str,
        checksum: &str,
    ) -> Result<(), StoreError> {
        let query = sql::insert_ledger(&self.schema, ledger);
        sqlx::query(&query)
            .bind(step)
            .bind(checksum)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| statement_error(&self.schema, &e))?;
        Ok(())
    }

    async fn execute(&mut self, change: &Change) -> Result<(), StoreError> {
        let statement = sql::render_change(&self.schema, change);
        self.run(&statement).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { schema, tx } = *self;
        tx.commit()
            .await
            .map_err(|e| statement_error(&schema, &e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let Self { schema, tx } = *self;
        tx.rollback()
            .await
            .map_err(|e| statement_error(&schema, &e))
    }
}

/// Connection-class failures: transport errors, pool exhaustion and SQLSTATE
/// class 08 or admin shutdown.
fn is_connection_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code == "57P01"),
        _ => false,
    }
}

fn statement_error(schema: &Ident, err: &sqlx::Error) -> StoreError {
    if is_connection_failure(err) {
        StoreError::Connection {
            message: err.to_string(),
        }
    } else {
        StoreError::Statement {
            schema: schema.to_string(),
            message: err.to_string(),
        }
    }
}

fn catalog_error(err: &sqlx::Error) -> StoreError {
    if is_connection_failure(err) {
        StoreError::Connection {
            message: err.to_string(),
        }
    } else {
        StoreError::Catalog {
            message: err.to_string(),
        }
    }
}
