//! Migration plans: named, ordered, idempotent structural changes.
//!
//! A plan is authored as YAML:
//!
//! ```yaml
//! name: patient-flags
//! requires_tables: [patients]
//! steps:
//!   - name: 001_flag_types
//!     kind: create_table
//!     table: flag_types
//!     columns:
//!       - "id UUID PRIMARY KEY DEFAULT gen_random_uuid()"
//!       - "label TEXT NOT NULL"
//!   - name: 002_flag_types_label_idx
//!     kind: create_index
//!     index: idx_flag_types_label
//!     table: flag_types
//!     columns: [label]
//! ```
//!
//! Free-form SQL fragments (column definitions, index predicates, raw
//! statements) may reference the tenant schema with the `{schema}`
//! placeholder; it expands to the quoted schema name of the tenant being
//! migrated.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::ident::Ident;

/// Placeholder replaced by the quoted tenant schema in raw SQL fragments.
pub const SCHEMA_PLACEHOLDER: &str = "{schema}";

/// Longest step name the ledger column accepts.
pub const MAX_STEP_NAME: usize = 255;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse plan: {0}")]
    Parse(String),

    #[error("plan name must not be empty")]
    MissingName,

    #[error("plan '{plan}' has no steps")]
    Empty { plan: String },

    #[error("duplicate step name '{name}' in plan '{plan}'")]
    DuplicateStep { plan: String, name: String },

    #[error("invalid step name '{name}' in plan '{plan}': {reason}")]
    InvalidStepName {
        plan: String,
        name: String,
        reason: &'static str,
    },

    #[error("step '{step}' in plan '{plan}' is invalid: {reason}")]
    InvalidStep {
        plan: String,
        step: String,
        reason: &'static str,
    },
}

/// The structural change a step performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// `ALTER TABLE .. ADD COLUMN IF NOT EXISTS`
    AddColumn {
        table: Ident,
        column: Ident,
        definition: String,
    },
    /// `CREATE TABLE IF NOT EXISTS`; each entry is one column or constraint.
    CreateTable { table: Ident, columns: Vec<String> },
    /// `CREATE [UNIQUE] INDEX IF NOT EXISTS`
    CreateIndex {
        index: Ident,
        table: Ident,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
        #[serde(default)]
        predicate: Option<String>,
    },
    /// Raw SQL. It must be safe to run more than once.
    Sql { sql: String },
}

impl Change {
    /// The table the change targets, when there is one.
    #[must_use]
    pub fn table(&self) -> Option<&Ident> {
        match self {
            Self::AddColumn { table, .. }
            | Self::CreateTable { table, .. }
            | Self::CreateIndex { table, .. } => Some(table),
            Self::Sql { .. } => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddColumn { .. } => "add_column",
            Self::CreateTable { .. } => "create_table",
            Self::CreateIndex { .. } => "create_index",
            Self::Sql { .. } => "sql",
        }
    }

    /// Whitespace-insensitive text form used for checksums.
    fn canonical(&self) -> String {
        match self {
            Self::AddColumn {
                table,
                column,
                definition,
            } => format!("add_column|{table}|{column}|{}", squash(definition)),
            Self::CreateTable { table, columns } => {
                let cols: Vec<String> = columns.iter().map(|c| squash(c)).collect();
                format!("create_table|{table}|{}", cols.join(","))
            }
            Self::CreateIndex {
                index,
                table,
                columns,
                unique,
                predicate,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| squash(c)).collect();
                format!(
                    "create_index|{index}|{table}|{}|{unique}|{}",
                    cols.join(","),
                    predicate.as_deref().map(squash).unwrap_or_default()
                )
            }
            Self::Sql { sql } => format!("sql|{}", squash(sql)),
        }
    }
}

/// One named step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Step is a no-op (and stays unrecorded) while this table is absent.
    #[serde(default)]
    pub only_if_table: Option<Ident>,
    #[serde(flatten)]
    pub change: Change,
}

impl MigrationStep {
    /// Stable fingerprint of what the step does, stored in the ledger.
    ///
    /// Renaming the step or editing its description does not change it;
    /// editing the SQL it produces does.
    #[must_use]
    pub fn checksum(&self) -> String {
        let guard = self
            .only_if_table
            .as_ref()
            .map(Ident::as_str)
            .unwrap_or_default();
        let text = format!("{}|guard={guard}", self.change.canonical());
        format!("{:016x}", xxh3_64(text.as_bytes()))
    }
}

/// An ordered list of steps applied to each tenant schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Tenants missing any of these tables are skipped entirely.
    #[serde(default)]
    pub requires_tables: Vec<Ident>,
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    /// Parse and validate a plan from YAML text.
    ///
    /// # Errors
    /// Returns [`PlanError`] if the YAML is malformed or the plan fails
    /// validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PlanError> {
        let plan: Self = serde_saphyr::from_str(yaml).map_err(|e| PlanError::Parse(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Read, parse and validate a plan file.
    ///
    /// # Errors
    /// Returns [`PlanError::Read`] if the file cannot be read, otherwise the
    /// same errors as [`MigrationPlan::from_yaml_str`].
    pub fn from_path(path: &Path) -> Result<Self, PlanError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Check names and step shapes.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.name.trim().is_empty() {
            return Err(PlanError::MissingName);
        }
        if self.steps.is_empty() {
            return Err(PlanError::Empty {
                plan: self.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            self.validate_step_name(&step.name)?;
            if !seen.insert(step.name.as_str()) {
                return Err(PlanError::DuplicateStep {
                    plan: self.name.clone(),
                    name: step.name.clone(),
                });
            }
            self.validate_change(step)?;
        }
        Ok(())
    }

    fn validate_step_name(&self, name: &str) -> Result<(), PlanError> {
        let reason = if name.trim().is_empty() {
            Some("must not be empty")
        } else if name.len() > MAX_STEP_NAME {
            Some("longer than 255 bytes")
        } else if name.trim() != name {
            Some("has leading or trailing whitespace")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(PlanError::InvalidStepName {
                plan: self.name.clone(),
                name: name.to_owned(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn validate_change(&self, step: &MigrationStep) -> Result<(), PlanError> {
        let reason = match &step.change {
            Change::AddColumn { definition, .. } if definition.trim().is_empty() => {
                Some("add_column needs a definition")
            }
            Change::CreateTable { columns, .. } if columns.is_empty() => {
                Some("create_table needs at least one column")
            }
            Change::CreateIndex { columns, .. } if columns.is_empty() => {
                Some("create_index needs at least one column")
            }
            Change::Sql { sql } if sql.trim().is_empty() => Some("sql must not be empty"),
            // Without session state the placeholder is the only thing that
            // scopes raw SQL to the tenant.
            Change::Sql { sql } if !sql.contains(SCHEMA_PLACEHOLDER) => {
                Some("sql must reference the tenant schema with {schema}")
            }
            _ => None,
        };
        match reason {
            Some(reason) => Err(PlanError::InvalidStep {
                plan: self.name.clone(),
                step: step.name.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Replace `{schema}` with the quoted tenant schema.
#[must_use]
pub fn expand_schema(fragment: &str, schema: &Ident) -> String {
    fragment.replace(SCHEMA_PLACEHOLDER, &schema.quoted())
}

fn squash(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
