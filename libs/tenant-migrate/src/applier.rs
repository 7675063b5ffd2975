//! Applies a plan to one tenant schema inside a single transaction.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::discovery::Tenant;
use crate::ident::Ident;
use crate::plan::{MigrationPlan, MigrationStep};
use crate::report::{TenantOutcome, TenantStatus};
use crate::store::{StoreError, TenantStore, TenantTx};

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub ledger_table: Ident,
    /// Report pending steps and roll back without executing anything.
    pub dry_run: bool,
    /// Create the tenant schema when the catalog does not have it.
    pub create_schema: bool,
}

/// How the transaction body ended.
enum Body {
    Commit(TenantOutcome),
    Rollback(TenantOutcome),
}

/// A step that could not be applied.
struct StepFailure {
    step: Option<String>,
    error: StoreError,
}

impl From<StoreError> for StepFailure {
    fn from(error: StoreError) -> Self {
        Self { step: None, error }
    }
}

/// Apply `plan` to `tenant`.
///
/// Statement failures roll the tenant back and come back as a failed
/// outcome. Only connectivity errors are returned as `Err`.
///
/// # Errors
/// Returns [`StoreError::Connection`] when the database is unreachable.
pub async fn apply_tenant(
    store: &dyn TenantStore,
    tenant: &Tenant,
    plan: &MigrationPlan,
    opts: &ApplyOptions,
) -> Result<TenantOutcome, StoreError> {
    let started = Instant::now();
    let schema = &tenant.schema;

    if !tenant.exists && !opts.create_schema {
        warn!(schema = %schema, "schema does not exist, skipping");
        return Ok(
            TenantOutcome::skipped(tenant, "schema does not exist").with_duration(started.elapsed()),
        );
    }

    let mut tx = match store.begin(schema).await {
        Ok(tx) => tx,
        Err(e) if e.is_connectivity() => return Err(e),
        Err(e) => {
            return Ok(TenantOutcome::failed(tenant, None, e.to_string())
                .with_duration(started.elapsed()));
        }
    };

    let outcome = match run_steps(tx.as_mut(), tenant, plan, opts).await {
        Ok(Body::Commit(outcome)) => match tx.commit().await {
            Ok(()) => {
                info!(
                    schema = %schema,
                    applied = outcome.applied.len(),
                    skipped = outcome.already_applied.len() + outcome.guarded.len(),
                    "tenant migrated"
                );
                outcome
            }
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => TenantOutcome::failed(tenant, None, format!("commit failed: {e}")),
        },
        Ok(Body::Rollback(outcome)) => {
            if let Err(e) = tx.rollback().await {
                if e.is_connectivity() {
                    return Err(e);
                }
                debug!(schema = %schema, error = %e, "rollback failed");
            }
            outcome
        }
        Err(failure) => {
            // A lost connection already discarded the transaction.
            if failure.error.is_connectivity() {
                drop(tx);
                return Err(failure.error);
            }
            if let Err(e) = tx.rollback().await {
                debug!(schema = %schema, error = %e, "rollback failed");
            }
            warn!(
                schema = %schema,
                step = failure.step.as_deref().unwrap_or("-"),
                error = %failure.error,
                "tenant failed, rolled back"
            );
            TenantOutcome::failed(tenant, failure.step.as_deref(), failure.error.to_string())
        }
    };

    Ok(outcome.with_duration(started.elapsed()))
}

async fn run_steps(
    tx: &mut dyn TenantTx,
    tenant: &Tenant,
    plan: &MigrationPlan,
    opts: &ApplyOptions,
) -> Result<Body, StepFailure> {
    let schema = &tenant.schema;

    if !tenant.exists {
        tx.ensure_schema().await?;
    }

    for table in &plan.requires_tables {
        if !tx.table_exists(table).await? {
            warn!(schema = %schema, table = %table, "required table missing, skipping tenant");
            return Ok(Body::Rollback(TenantOutcome::skipped(
                tenant,
                format!("missing required table {table}"),
            )));
        }
    }

    let ledger = if opts.dry_run {
        if tx.table_exists(&opts.ledger_table).await? {
            tx.ledger_entries(&opts.ledger_table).await?
        } else {
            HashMap::new()
        }
    } else {
        tx.ensure_ledger(&opts.ledger_table).await?;
        tx.ledger_entries(&opts.ledger_table).await?
    };

    let mut outcome = TenantOutcome::success(tenant);
    for step in &plan.steps {
        let checksum = step.checksum();

        if let Some(recorded) = ledger.get(&step.name) {
            if *recorded != checksum {
                return Err(StepFailure {
                    step: Some(step.name.clone()),
                    error: StoreError::Statement {
                        schema: schema.to_string(),
                        message: format!(
                            "step '{}' was applied with checksum {recorded}, plan now has {checksum}",
                            step.name
                        ),
                    },
                });
            }
            debug!(schema = %schema, step = %step.name, "already applied");
            outcome.already_applied.push(step.name.clone());
            continue;
        }

        if let Some(guard) = &step.only_if_table
            && !tx.table_exists(guard).await.map_err(|e| at_step(step, e))?
        {
            debug!(schema = %schema, step = %step.name, table = %guard, "guard table missing");
            outcome.guarded.push(step.name.clone());
            continue;
        }

        if opts.dry_run {
            outcome.pending.push(step.name.clone());
            continue;
        }

        debug!(schema = %schema, step = %step.name, kind = step.change.kind(), "applying step");
        tx.execute(&step.change).await.map_err(|e| at_step(step, e))?;
        tx.record(&opts.ledger_table, &step.name, &checksum)
            .await
            .map_err(|e| at_step(step, e))?;
        outcome.applied.push(step.name.clone());
    }

    if opts.dry_run {
        outcome.status = TenantStatus::Skipped;
        outcome.message = Some("dry run".to_owned());
        return Ok(Body::Rollback(outcome));
    }
    Ok(Body::Commit(outcome))
}

fn at_step(step: &MigrationStep, error: StoreError) -> StepFailure {
    StepFailure {
        step: Some(step.name.clone()),
        error,
    }
}
