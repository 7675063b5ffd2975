//! SQL text for every statement the runner issues.
//!
//! Identifiers come in as [`Ident`] and are always quoted and
//! schema-qualified here; values travel as bind parameters.

use crate::config::RegistryConfig;
use crate::ident::Ident;
use crate::plan::{Change, expand_schema};

/// Every schema in the database except the system ones.
pub const LIST_SCHEMAS: &str = r"
    SELECT schema_name::text
    FROM information_schema.schemata
    WHERE schema_name NOT LIKE 'pg\_%'
      AND schema_name <> 'information_schema'
    ORDER BY schema_name
";

/// `$1` is a qualified, quoted table name.
pub const TABLE_EXISTS: &str = "SELECT to_regclass($1) IS NOT NULL";

#[must_use]
pub fn create_schema(schema: &Ident) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", schema.quoted())
}

#[must_use]
pub fn create_ledger(schema: &Ident, ledger: &Ident) -> String {
    format!(
        r"CREATE TABLE IF NOT EXISTS {} (
    name VARCHAR(255) PRIMARY KEY,
    checksum VARCHAR(16) NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
)",
        schema.qualify(ledger)
    )
}

#[must_use]
pub fn select_ledger(schema: &Ident, ledger: &Ident) -> String {
    format!("SELECT name, checksum FROM {}", schema.qualify(ledger))
}

#[must_use]
pub fn insert_ledger(schema: &Ident, ledger: &Ident) -> String {
    format!(
        "INSERT INTO {} (name, checksum) VALUES ($1, $2)",
        schema.qualify(ledger)
    )
}

/// Registry rows as `(id, schema, status)` text columns.
#[must_use]
pub fn select_registry(registry: &RegistryConfig) -> String {
    let status = registry
        .status_column
        .as_ref()
        .map_or_else(|| "NULL".to_owned(), Ident::quoted);
    format!(
        "SELECT {id}::text, {schema}::text, {status}::text FROM {table} ORDER BY {schema}",
        id = registry.id_column.quoted(),
        schema = registry.schema_column.quoted(),
        table = registry.schema.qualify(&registry.table),
    )
}

/// The DDL for one change, qualified with `schema`.
#[must_use]
pub fn render_change(schema: &Ident, change: &Change) -> String {
    match change {
        Change::AddColumn {
            table,
            column,
            definition,
        } => format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            schema.qualify(table),
            column.quoted(),
            expand_schema(definition.trim(), schema)
        ),
        Change::CreateTable { table, columns } => {
            let body: Vec<String> = columns
                .iter()
                .map(|c| format!("    {}", expand_schema(c.trim(), schema)))
                .collect();
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
                schema.qualify(table),
                body.join(",\n")
            )
        }
        Change::CreateIndex {
            index,
            table,
            columns,
            unique,
            predicate,
        } => {
            let cols: Vec<&str> = columns.iter().map(|c| c.trim()).collect();
            let mut sql = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if *unique { "UNIQUE " } else { "" },
                index.quoted(),
                schema.qualify(table),
                cols.join(", ")
            );
            if let Some(predicate) = predicate {
                sql.push_str(" WHERE ");
                sql.push_str(&expand_schema(predicate.trim(), schema));
            }
            sql
        }
        Change::Sql { sql } => expand_schema(sql.trim(), schema),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn ident(s: &str) -> Ident {
        Ident::new(s).unwrap()
    }

    #[test]
    fn add_column_is_qualified_and_conditional() {
        let change = Change::AddColumn {
            table: ident("appointments"),
            column: ident("patient_status_snapshot"),
            definition: "VARCHAR(50)".to_owned(),
        };
        assert_eq!(
            render_change(&ident("tenant_miami"), &change),
            r#"ALTER TABLE "tenant_miami"."appointments" ADD COLUMN IF NOT EXISTS "patient_status_snapshot" VARCHAR(50)"#
        );
    }

    #[test]
    fn create_table_expands_placeholder_in_columns() {
        let change = Change::CreateTable {
            table: ident("patient_flags"),
            columns: vec![
                "id UUID PRIMARY KEY".to_owned(),
                "flag_type_id UUID REFERENCES {schema}.flag_types(id)".to_owned(),
            ],
        };
        assert_eq!(
            render_change(&ident("tenant_a"), &change),
            "CREATE TABLE IF NOT EXISTS \"tenant_a\".\"patient_flags\" (\n    id UUID PRIMARY KEY,\n    flag_type_id UUID REFERENCES \"tenant_a\".flag_types(id)\n)"
        );
    }

    #[test]
    fn unique_partial_index() {
        let change = Change::CreateIndex {
            index: ident("idx_flags_active"),
            table: ident("patient_flags"),
            columns: vec!["patient_id".to_owned(), " status ".to_owned()],
            unique: true,
            predicate: Some("status = 'active'".to_owned()),
        };
        assert_eq!(
            render_change(&ident("tenant_a"), &change),
            r#"CREATE UNIQUE INDEX IF NOT EXISTS "idx_flags_active" ON "tenant_a"."patient_flags" (patient_id, status) WHERE status = 'active'"#
        );
    }

    #[test]
    fn raw_sql_only_expands_placeholder() {
        let change = Change::Sql {
            sql: "  UPDATE {schema}.appointments SET status = 'scheduled' WHERE status IS NULL ".to_owned(),
        };
        assert_eq!(
            render_change(&ident("tenant_b"), &change),
            "UPDATE \"tenant_b\".appointments SET status = 'scheduled' WHERE status IS NULL"
        );
    }

    #[test]
    fn ledger_statements_target_tenant_schema() {
        let schema = ident("tenant_a");
        let ledger = ident("tenant_schema_migrations");
        assert!(create_ledger(&schema, &ledger)
            .starts_with(r#"CREATE TABLE IF NOT EXISTS "tenant_a"."tenant_schema_migrations""#));
        assert_eq!(
            insert_ledger(&schema, &ledger),
            r#"INSERT INTO "tenant_a"."tenant_schema_migrations" (name, checksum) VALUES ($1, $2)"#
        );
        assert_eq!(create_schema(&schema), r#"CREATE SCHEMA IF NOT EXISTS "tenant_a""#);
    }

    #[test]
    fn registry_query_without_status_column() {
        let mut registry = RegistryConfig::default();
        assert_eq!(
            select_registry(&registry),
            r#"SELECT "slug"::text, "schema_name"::text, "status"::text FROM "public"."clinics" ORDER BY "schema_name""#
        );
        registry.status_column = None;
        assert!(select_registry(&registry).contains("NULL::text"));
    }
}
