//! PostgreSQL staging store

use std::sync::{Mutex, MutexGuard};

use tokio::runtime::Runtime;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

use super::{RelationalError, RelationalStore, TableLayout, TextRow, UpsertStats};
use crate::config::PostgresConnection;

/// PostgreSQL database holding the staging tables
///
/// The async client runs on a private runtime so the store can be used from
/// the synchronous pipeline.
pub struct PostgresStore {
    runtime: Runtime,
    client: Mutex<Client>,
    description: String,
}

impl PostgresStore {
    pub fn connect(connection: &PostgresConnection) -> Result<Self, RelationalError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| RelationalError::Unsupported(format!("failed to start runtime: {}", e)))?;

        let client = runtime.block_on(async {
            let (client, driver) = connection.to_config().connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = driver.await {
                    tracing::error!(error = %e, "postgres connection closed");
                }
            });
            Ok::<_, RelationalError>(client)
        })?;

        Ok(Self {
            runtime,
            client: Mutex::new(client),
            description: format!("postgres:{}", connection),
        })
    }

    fn client(&self) -> Result<MutexGuard<'_, Client>, RelationalError> {
        self.client
            .lock()
            .map_err(|_| RelationalError::Database("client lock poisoned".to_string()))
    }
}

/// Concurrent `CREATE ... IF NOT EXISTS` of the same object can lose the
/// race on the catalog's unique index; the object exists either way.
fn lost_create_race(code: Option<&SqlState>) -> bool {
    matches!(
        code,
        Some(c) if *c == SqlState::UNIQUE_VIOLATION
            || *c == SqlState::DUPLICATE_SCHEMA
            || *c == SqlState::DUPLICATE_TABLE
    )
}

async fn create_if_missing(client: &Client, sql: &str) -> Result<(), RelationalError> {
    match client.batch_execute(sql).await {
        Err(e) if lost_create_race(e.code()) => {
            tracing::debug!(error = %e, "object created concurrently");
            Ok(())
        }
        other => Ok(other?),
    }
}

fn params(row: &TextRow) -> Vec<&(dyn ToSql + Sync)> {
    row.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

impl RelationalStore for PostgresStore {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn ensure_table(&self, layout: &TableLayout) -> Result<(), RelationalError> {
        let client = self.client()?;
        self.runtime.block_on(async {
            create_if_missing(&client, &layout.create_schema_sql()).await?;
            create_if_missing(&client, &layout.create_table_sql()).await?;
            let rows = client
                .query(
                    "SELECT column_name::text FROM information_schema.columns \
                     WHERE table_schema = $1::text AND table_name = $2::text",
                    &[&layout.schema, &layout.table],
                )
                .await?;
            let existing: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
            let missing = layout.missing_columns(&existing);
            if !missing.is_empty() {
                return Err(RelationalError::SchemaMismatch {
                    table: layout.qualified_name(),
                    missing,
                });
            }
            Ok(())
        })
    }

    fn upsert(&self, layout: &TableLayout, rows: &[TextRow]) -> Result<UpsertStats, RelationalError> {
        layout.check_row_shapes(rows)?;
        let mut client = self.client()?;
        self.runtime.block_on(async {
            let tx = client.transaction().await?;
            let before: i64 = tx.query_one(&layout.count_sql(), &[]).await?.get(0);

            let statement = tx.prepare(&layout.upsert_sql()).await?;
            for row in rows {
                // An error here drops `tx`, which rolls back.
                tx.execute(&statement, &params(row)).await?;
            }

            let after: i64 = tx.query_one(&layout.count_sql(), &[]).await?.get(0);
            tx.commit().await?;

            let inserted = (after - before).max(0) as u64;
            Ok(UpsertStats {
                inserted,
                updated: (rows.len() as u64).saturating_sub(inserted),
                row_count: after as u64,
            })
        })
    }

    fn row_count(&self, layout: &TableLayout) -> Result<u64, RelationalError> {
        let client = self.client()?;
        self.runtime.block_on(async {
            let count: i64 = client.query_one(&layout.count_sql(), &[]).await?.get(0);
            Ok(count as u64)
        })
    }

    fn fetch_rows(&self, layout: &TableLayout) -> Result<Vec<TextRow>, RelationalError> {
        let client = self.client()?;
        let width = layout.columns.len();
        self.runtime.block_on(async {
            let rows = client.query(&layout.select_sql(), &[]).await?;
            Ok(rows
                .iter()
                .map(|row| (0..width).map(|i| row.get::<_, Option<String>>(i)).collect())
                .collect())
        })
    }
}
