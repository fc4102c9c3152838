//! Relational staging tables
//!
//! One table per dataset, `"{staging_schema}"."{staging_table}"`, with the
//! contract's columns and primary key. Rows are only ever upserted.
//!
//! Values travel as text and are cast in SQL, so both backends share the same
//! statements and type conversions happen in one place.

#[cfg(feature = "duckdb-backend")]
mod duckdb_store;
#[cfg(feature = "postgres-backend")]
mod postgres_store;

use thiserror::Error;

use crate::contract::DatasetContract;

#[cfg(feature = "duckdb-backend")]
pub use duckdb_store::DuckDbStore;
#[cfg(feature = "postgres-backend")]
pub use postgres_store::PostgresStore;

/// One row of text cells in layout column order; `None` is SQL NULL
pub type TextRow = Vec<Option<String>>;

/// Errors raised by relational backends
#[derive(Error, Debug)]
pub enum RelationalError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Existing table does not have the expected columns
    #[error("Table {table} is missing column(s): {}", .missing.join(", "))]
    SchemaMismatch { table: String, missing: Vec<String> },

    /// A row does not match the layout
    #[error("Row {row} has {found} values, expected {expected}")]
    RowShape {
        row: usize,
        found: usize,
        expected: usize,
    },

    /// Backend not compiled in or not reachable
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

#[cfg(feature = "duckdb-backend")]
impl From<duckdb::Error> for RelationalError {
    fn from(err: duckdb::Error) -> Self {
        RelationalError::Database(err.to_string())
    }
}

#[cfg(feature = "postgres-backend")]
impl From<tokio_postgres::Error> for RelationalError {
    fn from(err: tokio_postgres::Error) -> Self {
        RelationalError::Database(err.to_string())
    }
}

/// Column of a staging table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    pub name: String,
    pub sql_type: &'static str,
    pub not_null: bool,
}

/// Physical shape of a dataset's staging table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnLayout>,
    pub primary_key: Vec<String>,
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

impl TableLayout {
    pub fn from_contract(contract: &DatasetContract) -> Self {
        Self {
            schema: contract.staging_schema.clone(),
            table: contract.staging_table.clone(),
            columns: contract
                .schema
                .iter()
                .map(|column| ColumnLayout {
                    name: column.name.clone(),
                    sql_type: column.column_type.sql_type(),
                    not_null: contract.is_required(column),
                })
                .collect(),
            primary_key: contract.primary_key.clone(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote(&self.schema), quote(&self.table))
    }

    pub fn create_schema_sql(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote(&self.schema))
    }

    pub fn create_table_sql(&self) -> String {
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut definition = format!("{} {}", quote(&c.name), c.sql_type);
                if c.not_null {
                    definition.push_str(" NOT NULL");
                }
                definition
            })
            .collect();
        definitions.push(format!("PRIMARY KEY ({})", self.key_list()));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified_name(),
            definitions.join(", ")
        )
    }

    /// Upsert statement with `$n` placeholders, one per column
    pub fn upsert_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote(&c.name)).collect();
        let values: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("CAST(${}::VARCHAR AS {})", i + 1, c.sql_type))
            .collect();
        let updates: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !self.primary_key.contains(&c.name))
            .map(|c| format!("{0} = excluded.{0}", quote(&c.name)))
            .collect();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            self.qualified_name(),
            columns.join(", "),
            values.join(", "),
            self.key_list(),
            conflict
        )
    }

    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {}", self.qualified_name())
    }

    /// Every column cast to text, ordered by primary key
    pub fn select_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("CAST({} AS VARCHAR)", quote(&c.name)))
            .collect();
        format!(
            "SELECT {} FROM {} ORDER BY {}",
            columns.join(", "),
            self.qualified_name(),
            self.key_list()
        )
    }

    /// Existing column names, parameters `$1` schema and `$2` table
    pub fn columns_sql() -> &'static str {
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2"
    }

    fn key_list(&self) -> String {
        self.primary_key
            .iter()
            .map(|k| quote(k))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Columns the layout needs that `existing` does not have
    pub fn missing_columns(&self, existing: &[String]) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !existing.iter().any(|e| e == &c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    pub(crate) fn check_row_shapes(&self, rows: &[TextRow]) -> Result<(), RelationalError> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(RelationalError::RowShape {
                    row: i + 1,
                    found: row.len(),
                    expected: self.columns.len(),
                });
            }
        }
        Ok(())
    }
}

/// Outcome of one committed upsert batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    /// Keys that did not exist before
    pub inserted: u64,
    /// Keys that existed and were replaced
    pub updated: u64,
    /// Table row count after commit
    pub row_count: u64,
}

/// Relational target for the load stage
pub trait RelationalStore: Send + Sync {
    /// Human-readable backend description for logs
    fn describe(&self) -> String;

    /// Create the schema and table when absent; fail if an existing table
    /// lacks layout columns
    fn ensure_table(&self, layout: &TableLayout) -> Result<(), RelationalError>;

    /// Upsert every row in a single transaction; on error nothing is applied
    fn upsert(&self, layout: &TableLayout, rows: &[TextRow]) -> Result<UpsertStats, RelationalError>;

    fn row_count(&self, layout: &TableLayout) -> Result<u64, RelationalError>;

    /// Every row as text, ordered by primary key
    fn fetch_rows(&self, layout: &TableLayout) -> Result<Vec<TextRow>, RelationalError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ColumnSpec, SemanticType};

    fn layout() -> TableLayout {
        let contract = DatasetContract::new(
            "guides",
            "file:///tmp/g.txt",
            vec![
                ColumnSpec::new("last_name", SemanticType::String),
                ColumnSpec::new("city", SemanticType::String).required(),
                ColumnSpec::new("licences", SemanticType::Integer),
            ],
            vec!["last_name".to_string()],
        );
        TableLayout::from_contract(&contract)
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            layout().create_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"staging\".\"guides\" (\"last_name\" VARCHAR NOT NULL, \
             \"city\" VARCHAR NOT NULL, \"licences\" BIGINT, PRIMARY KEY (\"last_name\"))"
        );
        assert_eq!(
            layout().create_schema_sql(),
            "CREATE SCHEMA IF NOT EXISTS \"staging\""
        );
    }

    #[test]
    fn test_upsert_sql() {
        assert_eq!(
            layout().upsert_sql(),
            "INSERT INTO \"staging\".\"guides\" (\"last_name\", \"city\", \"licences\") VALUES \
             (CAST($1::VARCHAR AS VARCHAR), CAST($2::VARCHAR AS VARCHAR), CAST($3::VARCHAR AS BIGINT)) \
             ON CONFLICT (\"last_name\") DO UPDATE SET \"city\" = excluded.\"city\", \
             \"licences\" = excluded.\"licences\""
        );
    }

    #[test]
    fn test_key_only_table_does_nothing_on_conflict() {
        let mut layout = layout();
        layout.columns.truncate(1);
        assert!(layout.upsert_sql().ends_with("ON CONFLICT (\"last_name\") DO NOTHING"));
    }

    #[test]
    fn test_missing_columns_and_row_shape() {
        let layout = layout();
        assert_eq!(
            layout.missing_columns(&["last_name".to_string(), "city".to_string()]),
            vec!["licences".to_string()]
        );
        assert!(layout.check_row_shapes(&[vec![None, None, None]]).is_ok());
        assert!(matches!(
            layout.check_row_shapes(&[vec![None]]),
            Err(RelationalError::RowShape { row: 1, found: 1, expected: 3 })
        ));
    }
}
