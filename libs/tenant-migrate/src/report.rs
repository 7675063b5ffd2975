//! Per-tenant outcomes and the run summary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ExitPolicy;
use crate::discovery::{RejectedSchema, Tenant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Success,
    Skipped,
    Failed,
}

impl TenantStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// What happened to one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantOutcome {
    pub tenant: String,
    pub schema: String,
    pub status: TenantStatus,
    /// Steps executed and recorded by this run.
    pub applied: Vec<String>,
    /// Steps found in the ledger.
    pub already_applied: Vec<String>,
    /// Steps whose `only_if_table` was absent.
    pub guarded: Vec<String>,
    /// Steps a dry run would execute.
    pub pending: Vec<String>,
    pub failed_step: Option<String>,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl TenantOutcome {
    fn new(tenant: &Tenant, status: TenantStatus) -> Self {
        Self {
            tenant: tenant.id.clone(),
            schema: tenant.schema.to_string(),
            status,
            applied: Vec::new(),
            already_applied: Vec::new(),
            guarded: Vec::new(),
            pending: Vec::new(),
            failed_step: None,
            message: None,
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn success(tenant: &Tenant) -> Self {
        Self::new(tenant, TenantStatus::Success)
    }

    #[must_use]
    pub fn skipped(tenant: &Tenant, reason: impl Into<String>) -> Self {
        Self {
            message: Some(reason.into()),
            ..Self::new(tenant, TenantStatus::Skipped)
        }
    }

    #[must_use]
    pub fn failed(tenant: &Tenant, step: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            failed_step: step.map(str::to_owned),
            message: Some(message.into()),
            ..Self::new(tenant, TenantStatus::Failed)
        }
    }

    /// A schema that never made it past validation.
    #[must_use]
    pub fn rejected(rejected: &RejectedSchema) -> Self {
        Self {
            tenant: rejected.id.clone(),
            schema: rejected.name.clone(),
            status: TenantStatus::Failed,
            applied: Vec::new(),
            already_applied: Vec::new(),
            guarded: Vec::new(),
            pending: Vec::new(),
            failed_step: None,
            message: Some(format!("invalid schema name: {}", rejected.reason)),
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = millis(elapsed);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub tenants: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub steps_applied: usize,
}

impl Totals {
    fn from_outcomes(outcomes: &[TenantOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut t, o| {
            t.tenants += 1;
            match o.status {
                TenantStatus::Success => t.succeeded += 1,
                TenantStatus::Skipped => t.skipped += 1,
                TenantStatus::Failed => t.failed += 1,
            }
            t.steps_applied += o.applied.len();
            t
        })
    }
}

/// Result of a whole run, in discovery order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub totals: Totals,
    pub tenants: Vec<TenantOutcome>,
}

impl RunReport {
    #[must_use]
    pub fn new(
        plan: &str,
        dry_run: bool,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        tenants: Vec<TenantOutcome>,
    ) -> Self {
        Self {
            plan: plan.to_owned(),
            dry_run,
            started_at,
            duration_ms: millis(elapsed),
            totals: Totals::from_outcomes(&tenants),
            tenants,
        }
    }

    /// Whether the run counts as successful under `policy`.
    #[must_use]
    pub fn is_success(&self, policy: ExitPolicy) -> bool {
        match policy {
            ExitPolicy::Strict => self.totals.failed == 0,
            ExitPolicy::Lenient => true,
        }
    }

    #[must_use]
    pub fn failures(&self) -> impl Iterator<Item = &TenantOutcome> {
        self.tenants
            .iter()
            .filter(|o| o.status == TenantStatus::Failed)
    }

    /// `3 tenants: 2 succeeded, 1 skipped, 0 failed (4 steps applied) in 80ms`
    #[must_use]
    pub fn summary(&self) -> String {
        let t = &self.totals;
        format!(
            "{} tenants: {} succeeded, {} skipped, {} failed ({} steps applied) in {}ms",
            t.tenants, t.succeeded, t.skipped, t.failed, t.steps_applied, self.duration_ms
        )
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
