//! Drives one run: discovery once, then the applier per tenant.
//!
//! ```text
//! INIT -> DISCOVERING -> (APPLYING -> SUCCESS | SKIPPED | FAILED) x N -> DONE
//! ```
//!
//! Tenant failures are recorded and the loop moves on. A connectivity
//! error at any point aborts the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::applier::{ApplyOptions, apply_tenant};
use crate::config::{DiscoveryConfig, MigrateConfig, RunnerConfig};
use crate::discovery::{Discovery, DiscoveryError, Tenant, discover};
use crate::plan::MigrationPlan;
use crate::report::{RunReport, TenantOutcome};
use crate::store::{StoreError, TenantStore};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("lost database connectivity: {0}")]
    Connectivity(StoreError),

    #[error("discovery failed: {0}")]
    Discovery(StoreError),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),
}

impl From<DiscoveryError> for RunError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Store(e) if e.is_connectivity() => Self::Connectivity(e),
            DiscoveryError::Store(e) => Self::Discovery(e),
            DiscoveryError::TenantNotFound(name) => Self::TenantNotFound(name),
        }
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Discovering,
    Applying { done: usize, total: usize },
    Done,
}

pub struct MigrationDriver {
    store: Arc<dyn TenantStore>,
    discovery: DiscoveryConfig,
    runner: RunnerConfig,
}

impl MigrationDriver {
    #[must_use]
    pub fn new(store: Arc<dyn TenantStore>, config: &MigrateConfig) -> Self {
        Self {
            store,
            discovery: config.discovery.clone(),
            runner: config.runner.clone(),
        }
    }

    #[must_use]
    pub fn runner(&self) -> &RunnerConfig {
        &self.runner
    }

    /// Discover tenants, narrowed to `runner.tenant` when set.
    ///
    /// # Errors
    /// Returns [`RunError`] when the catalog is unreachable or the target
    /// tenant does not exist.
    pub async fn discover(&self) -> Result<Discovery, RunError> {
        let discovery = discover(self.store.as_ref(), &self.discovery).await?;
        match &self.runner.tenant {
            Some(target) => Ok(discovery.filter_target(target)?),
            None => Ok(discovery),
        }
    }

    /// Apply `plan` to every discovered tenant.
    ///
    /// # Errors
    /// See [`MigrationDriver::run_with_progress`].
    pub async fn run(&self, plan: &MigrationPlan) -> Result<RunReport, RunError> {
        self.run_with_progress(plan, |_| {}).await
    }

    /// Apply `plan`, calling `progress` with each outcome as it is reported.
    ///
    /// # Errors
    /// Returns [`RunError::Connectivity`] if the database goes away, and the
    /// discovery errors of [`MigrationDriver::discover`].
    pub async fn run_with_progress<F>(
        &self,
        plan: &MigrationPlan,
        mut progress: F,
    ) -> Result<RunReport, RunError>
    where
        F: FnMut(&TenantOutcome),
    {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut phase = RunPhase::Init;

        transition(&mut phase, RunPhase::Discovering);
        let discovery = self.discover().await?;

        let total = discovery.rejected.len() + discovery.tenants.len();
        let mut outcomes = Vec::with_capacity(total);
        transition(&mut phase, RunPhase::Applying { done: 0, total });

        for rejected in &discovery.rejected {
            let outcome = TenantOutcome::rejected(rejected);
            progress(&outcome);
            outcomes.push(outcome);
        }

        let opts = ApplyOptions {
            ledger_table: self.runner.ledger_table.clone(),
            dry_run: self.runner.dry_run,
            create_schema: self.runner.create_schemas,
        };
        let concurrency = self.runner.concurrency.max(1);
        info!(
            plan = %plan.name,
            tenants = discovery.tenants.len(),
            concurrency,
            dry_run = opts.dry_run,
            "applying plan"
        );

        // `buffered` keeps discovery order while running up to K at once.
        let mut results = stream::iter(
            discovery
                .tenants
                .iter()
                .map(|tenant| self.apply_one(tenant, plan, &opts)),
        )
        .buffered(concurrency);

        while let Some(result) = results.next().await {
            match result {
                Ok(outcome) => {
                    progress(&outcome);
                    outcomes.push(outcome);
                    transition(
                        &mut phase,
                        RunPhase::Applying {
                            done: outcomes.len(),
                            total,
                        },
                    );
                }
                Err(e) => {
                    warn!(error = %e, "aborting run");
                    return Err(RunError::Connectivity(e));
                }
            }
        }

        transition(&mut phase, RunPhase::Done);
        let report = RunReport::new(
            &plan.name,
            self.runner.dry_run,
            started_at,
            started.elapsed(),
            outcomes,
        );
        info!(summary = %report.summary(), "run finished");
        Ok(report)
    }

    async fn apply_one(
        &self,
        tenant: &Tenant,
        plan: &MigrationPlan,
        opts: &ApplyOptions,
    ) -> Result<TenantOutcome, StoreError> {
        let started = Instant::now();
        let apply = apply_tenant(self.store.as_ref(), tenant, plan, opts);

        let Some(limit) = self.runner.tenant_timeout else {
            return apply.await;
        };
        if let Ok(result) = tokio::time::timeout(limit, apply).await {
            result
        } else {
            warn!(schema = %tenant.schema, ?limit, "tenant timed out, rolled back");
            Ok(
                TenantOutcome::failed(tenant, None, format!("timed out after {}", fmt_limit(limit)))
                    .with_duration(started.elapsed()),
            )
        }
    }
}

fn transition(phase: &mut RunPhase, next: RunPhase) {
    debug!(from = ?*phase, to = ?next, "run phase");
    *phase = next;
}

fn fmt_limit(limit: Duration) -> String {
    if limit.subsec_millis() == 0 {
        format!("{}s", limit.as_secs())
    } else {
        format!("{}ms", limit.as_millis())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn discovery_errors_map_to_run_errors() {
        let lost = DiscoveryError::Store(StoreError::Connection {
            message: "refused".to_owned(),
        });
        assert!(matches!(RunError::from(lost), RunError::Connectivity(_)));

        let catalog = DiscoveryError::Store(StoreError::Catalog {
            message: "relation \"public\".\"clinics\" does not exist".to_owned(),
        });
        assert!(matches!(RunError::from(catalog), RunError::Discovery(_)));

        let missing = DiscoveryError::TenantNotFound("tenant_x".to_owned());
        assert_eq!(RunError::from(missing).to_string(), "tenant not found: tenant_x");
    }

    #[test]
    fn timeout_message_formatting() {
        assert_eq!(fmt_limit(Duration::from_secs(30)), "30s");
        assert_eq!(fmt_limit(Duration::from_millis(250)), "250ms");
    }
}
