//! Operator-facing output on stdout.

use anyhow::Result;
use colored::Colorize;
use tenant_migrate::{Discovery, ExitPolicy, RunReport, TenantOutcome, TenantStatus};

pub fn progress_line(outcome: &TenantOutcome) -> String {
    let mark = match outcome.status {
        TenantStatus::Success => "✓".green(),
        TenantStatus::Skipped => "-".yellow(),
        TenantStatus::Failed => "✗".red(),
    };
    let mut detail = Vec::new();
    if !outcome.applied.is_empty() {
        detail.push(format!("applied {}", outcome.applied.len()));
    }
    if !outcome.already_applied.is_empty() {
        detail.push(format!("already applied {}", outcome.already_applied.len()));
    }
    if !outcome.guarded.is_empty() {
        detail.push(format!("guarded {}", outcome.guarded.len()));
    }
    if !outcome.pending.is_empty() {
        detail.push(format!("pending: {}", outcome.pending.join(", ")));
    }
    if let Some(step) = &outcome.failed_step {
        detail.push(format!("at step {step}"));
    }
    if let Some(message) = &outcome.message {
        detail.push(message.clone());
    }

    let name = if outcome.tenant == outcome.schema {
        outcome.schema.clone()
    } else {
        format!("{} ({})", outcome.schema, outcome.tenant)
    };
    format!(
        "  {mark} {name:<32} {:<8} {} [{}ms]",
        outcome.status.as_str(),
        detail.join("; "),
        outcome.duration_ms
    )
}

pub fn print_progress(outcome: &TenantOutcome) {
    println!("{}", progress_line(outcome));
}

pub fn print_summary(report: &RunReport, policy: ExitPolicy) {
    println!();
    let title = if report.dry_run {
        format!("Plan '{}' (dry run)", report.plan)
    } else {
        format!("Plan '{}'", report.plan)
    };
    println!("{}", title.bold());
    let summary = report.summary();
    if report.totals.failed == 0 {
        println!("{}", summary.green());
    } else if report.is_success(policy) {
        println!("{}", summary.yellow());
    } else {
        println!("{}", summary.red());
    }

    let failures: Vec<&TenantOutcome> = report.failures().collect();
    if !failures.is_empty() {
        println!("{}", "Failed tenants:".red().bold());
        for outcome in failures {
            println!(
                "  {}: {}",
                outcome.schema,
                outcome.message.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_discovery(discovery: &Discovery) {
    for tenant in &discovery.tenants {
        let status = tenant.status.as_deref().unwrap_or("-");
        let exists = if tenant.exists { "" } else { " (missing)" };
        println!(
            "{:<32} {:<24} {:<8} {:?}{exists}",
            tenant.schema.as_str(),
            tenant.id,
            status,
            tenant.source
        );
    }
    for rejected in &discovery.rejected {
        println!(
            "{} {} ({})",
            "rejected".red(),
            rejected.name,
            rejected.reason
        );
    }
    println!(
        "{} tenants, {} rejected",
        discovery.tenants.len(),
        discovery.rejected.len()
    );
}
