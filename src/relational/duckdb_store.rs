//! DuckDB staging store

use std::sync::{Mutex, MutexGuard};

use duckdb::{Connection, params_from_iter};

use super::{RelationalError, RelationalStore, TableLayout, TextRow, UpsertStats};

/// Embedded DuckDB database holding the staging tables
pub struct DuckDbStore {
    conn: Mutex<Connection>,
    path: Option<String>,
}

impl DuckDbStore {
    /// Open or create a database file
    pub fn open(path: &str) -> Result<Self, RelationalError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn memory() -> Result<Self, RelationalError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Get the database path (if not in-memory)
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RelationalError> {
        self.conn
            .lock()
            .map_err(|_| RelationalError::Database("connection lock poisoned".to_string()))
    }

    fn count(conn: &Connection, layout: &TableLayout) -> Result<u64, RelationalError> {
        let count: i64 = conn.query_row(&layout.count_sql(), [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl RelationalStore for DuckDbStore {
    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("duckdb:{}", path),
            None => "duckdb:memory".to_string(),
        }
    }

    fn ensure_table(&self, layout: &TableLayout) -> Result<(), RelationalError> {
        let conn = self.conn()?;
        conn.execute_batch(&format!(
            "{};\n{};",
            layout.create_schema_sql(),
            layout.create_table_sql()
        ))?;

        let mut stmt = conn.prepare(TableLayout::columns_sql())?;
        let existing = stmt
            .query_map([&layout.schema, &layout.table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let missing = layout.missing_columns(&existing);
        if !missing.is_empty() {
            return Err(RelationalError::SchemaMismatch {
                table: layout.qualified_name(),
                missing,
            });
        }
        Ok(())
    }

    fn upsert(&self, layout: &TableLayout, rows: &[TextRow]) -> Result<UpsertStats, RelationalError> {
        layout.check_row_shapes(rows)?;
        let mut conn = self.conn()?;
        let before = Self::count(&conn, layout)?;

        // Dropping the transaction without commit rolls it back.
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&layout.upsert_sql())?;
            for row in rows {
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        let after = Self::count(&tx, layout)?;
        tx.commit()?;

        let inserted = after.saturating_sub(before);
        Ok(UpsertStats {
            inserted,
            updated: (rows.len() as u64).saturating_sub(inserted),
            row_count: after,
        })
    }

    fn row_count(&self, layout: &TableLayout) -> Result<u64, RelationalError> {
        let conn = self.conn()?;
        Self::count(&conn, layout)
    }

    fn fetch_rows(&self, layout: &TableLayout) -> Result<Vec<TextRow>, RelationalError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&layout.select_sql())?;
        let width = layout.columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Option<String>>(i))
                    .collect::<Result<TextRow, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
