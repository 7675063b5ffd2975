//! Tenant schema discovery.
//!
//! Sources are combined in a fixed order: included shared schemas (in
//! configuration order), then catalog schemas matching the prefix (by
//! name), then registry rows. A schema reached through several sources is
//! listed once, at its first position.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::ident::Ident;
use crate::store::{RegistryRow, StoreError, TenantStore};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),
}

/// Which rule selected a tenant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantSource {
    Include,
    Prefix,
    Registry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenant {
    /// Registry slug when known, otherwise the schema name.
    pub id: String,
    pub schema: Ident,
    pub status: Option<String>,
    pub source: TenantSource,
    /// Whether the schema is present in the catalog.
    pub exists: bool,
}

/// A candidate that failed validation and is never migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedSchema {
    pub id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub tenants: Vec<Tenant>,
    pub rejected: Vec<RejectedSchema>,
}

impl Discovery {
    /// Keep only the tenant whose schema or identifier equals `target`.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::TenantNotFound`] when nothing matches.
    pub fn filter_target(self, target: &str) -> Result<Self, DiscoveryError> {
        let tenants: Vec<Tenant> = self
            .tenants
            .into_iter()
            .filter(|t| t.schema.as_str() == target || t.id == target)
            .collect();
        let rejected: Vec<RejectedSchema> = self
            .rejected
            .into_iter()
            .filter(|r| r.name == target || r.id == target)
            .collect();

        if tenants.is_empty() && rejected.is_empty() {
            return Err(DiscoveryError::TenantNotFound(target.to_owned()));
        }
        Ok(Self { tenants, rejected })
    }
}

/// Query the store and select tenants.
///
/// # Errors
/// Returns [`DiscoveryError::Store`] when the catalog or registry cannot be
/// read.
pub async fn discover(
    store: &dyn TenantStore,
    config: &DiscoveryConfig,
) -> Result<Discovery, DiscoveryError> {
    let catalog = store.list_schemas().await?;
    let registry = match &config.registry {
        Some(registry) => store.list_registry(registry).await?,
        None => Vec::new(),
    };
    debug!(
        catalog = catalog.len(),
        registry = registry.len(),
        "catalog read"
    );

    let discovery = select(config, &catalog, &registry);
    info!(
        tenants = discovery.tenants.len(),
        rejected = discovery.rejected.len(),
        "discovery complete"
    );
    Ok(discovery)
}

/// Pure selection over catalog names and registry rows.
#[must_use]
pub fn select(config: &DiscoveryConfig, catalog: &[String], registry: &[RegistryRow]) -> Discovery {
    let mut out = Selection::default();

    for schema in &config.include {
        if catalog.iter().any(|name| name == schema.as_str()) {
            out.push(Tenant {
                id: schema.to_string(),
                schema: schema.clone(),
                status: None,
                source: TenantSource::Include,
                exists: true,
            });
        } else {
            debug!(schema = %schema, "included schema not present, ignoring");
        }
    }

    if let Some(prefix) = &config.prefix {
        let mut matches: Vec<&String> = catalog
            .iter()
            .filter(|name| name.starts_with(prefix.as_str()) && !is_system_schema(name))
            .collect();
        matches.sort();
        for name in matches {
            match Ident::new(name.as_str()) {
                Ok(schema) => out.push(Tenant {
                    id: name.clone(),
                    schema,
                    status: None,
                    source: TenantSource::Prefix,
                    exists: true,
                }),
                Err(e) => out.reject(name, name, e.to_string()),
            }
        }
    }

    if let Some(registry_cfg) = &config.registry {
        for row in registry {
            let Some(raw_schema) = row.schema.as_deref().map(str::trim) else {
                let id = row.id.clone().unwrap_or_default();
                out.reject(&id, "", "registry row has no schema".to_owned());
                continue;
            };
            let id = row.id.clone().unwrap_or_else(|| raw_schema.to_owned());
            if registry_cfg.status_column.is_some()
                && row.status.as_deref() != Some(registry_cfg.active_status.as_str())
            {
                debug!(tenant = %id, status = ?row.status, "registry row not active, skipping");
                continue;
            }
            let resolved = resolve_registry_name(catalog, raw_schema);
            if resolved != raw_schema {
                debug!(tenant = %id, registry = raw_schema, schema = %resolved, "folded registry schema name");
            }
            match Ident::new(resolved.as_str()) {
                Ok(schema) => {
                    let exists = catalog.iter().any(|name| *name == resolved);
                    out.push(Tenant {
                        id,
                        schema,
                        status: row.status.clone(),
                        source: TenantSource::Registry,
                        exists,
                    });
                }
                Err(e) => out.reject(&id, raw_schema, e.to_string()),
            }
        }
    }

    out.finish()
}

/// Registry names are written without quoting in tenant DDL, so Postgres
/// folds them to lower case. An exact catalog match still wins.
fn resolve_registry_name(catalog: &[String], raw: &str) -> String {
    if catalog.iter().any(|name| name == raw) {
        raw.to_owned()
    } else {
        raw.to_ascii_lowercase()
    }
}

fn is_system_schema(name: &str) -> bool {
    name.starts_with("pg_") || name == "information_schema"
}

#[derive(Default)]
struct Selection {
    tenants: Vec<Tenant>,
    positions: HashMap<Ident, usize>,
    rejected: Vec<RejectedSchema>,
}

impl Selection {
    fn push(&mut self, tenant: Tenant) {
        if let Some(&pos) = self.positions.get(&tenant.schema) {
            let existing = &mut self.tenants[pos];
            // A registry row names the tenant better than the schema does.
            if tenant.source == TenantSource::Registry && existing.source != TenantSource::Registry {
                existing.id = tenant.id;
                existing.status = tenant.status;
            }
            return;
        }
        self.positions
            .insert(tenant.schema.clone(), self.tenants.len());
        self.tenants.push(tenant);
    }

    fn reject(&mut self, id: &str, name: &str, reason: String) {
        if self.rejected.iter().any(|r| r.name == name && r.id == id) {
            return;
        }
        warn!(schema = name, reason = %reason, "excluding invalid tenant schema");
        self.rejected.push(RejectedSchema {
            id: id.to_owned(),
            name: name.to_owned(),
            reason,
        });
    }

    fn finish(self) -> Discovery {
        Discovery {
            tenants: self.tenants,
            rejected: self.rejected,
        }
    }
}
