//! Relational load of the latest silver snapshot

use serde_json::Value;
use tracing::info;

use super::{SilverTable, StageOutcome};
use crate::contract::DatasetContract;
use crate::error::{LoadError, NotFoundError, PipelineError};
use crate::relational::{RelationalStore, TableLayout, TextRow};
use crate::stage::{ObjectStage, Stage};

/// Convert typed silver rows to the text cells the relational store binds
pub fn silver_rows_as_text(table: &SilverTable) -> Vec<TextRow> {
    table
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|value| match value {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    Value::Bool(b) => Some(b.to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    other => Some(other.to_string()),
                })
                .collect()
        })
        .collect()
}

/// Upserts the latest silver snapshot into the dataset's staging table
pub struct LoadPipeline<'a> {
    stage: &'a dyn ObjectStage,
    store: &'a dyn RelationalStore,
}

impl<'a> LoadPipeline<'a> {
    pub fn new(stage: &'a dyn ObjectStage, store: &'a dyn RelationalStore) -> Self {
        Self { stage, store }
    }

    /// Upsert every silver row in one transaction
    ///
    /// Loading the same snapshot twice leaves the table unchanged.
    pub fn run(&self, contract: &DatasetContract) -> Result<StageOutcome, PipelineError> {
        let dataset_id = contract.dataset_id.as_str();
        let layout = TableLayout::from_contract(contract);
        let failure = |reason: String| LoadError {
            dataset_id: dataset_id.to_string(),
            table: layout.qualified_name(),
            reason,
        };

        let silver = self
            .stage
            .get_latest(dataset_id, Stage::Silver)?
            .ok_or_else(|| NotFoundError {
                dataset_id: dataset_id.to_string(),
                stage: Stage::Silver,
            })?;

        let table = SilverTable::from_bytes(&silver.payload)
            .map_err(|e| failure(format!("silver snapshot is unreadable: {}", e)))?;
        let expected = contract.column_names();
        let found = table.column_names();
        if found != expected {
            return Err(failure(format!(
                "silver columns [{}] do not match contract columns [{}]",
                found.join(", "),
                expected.join(", ")
            ))
            .into());
        }
        if table.rows.is_empty() {
            return Err(failure("silver snapshot has no rows".to_string()).into());
        }

        let rows = silver_rows_as_text(&table);
        self.store
            .ensure_table(&layout)
            .map_err(|e| failure(e.to_string()))?;
        let stats = self
            .store
            .upsert(&layout, &rows)
            .map_err(|e| failure(e.to_string()))?;

        info!(
            dataset_id,
            table = %layout.qualified_name(),
            backend = %self.store.describe(),
            inserted = stats.inserted,
            updated = stats.updated,
            row_count = stats.row_count,
            "Silver snapshot loaded"
        );
        Ok(StageOutcome::succeeded(format!(
            "{} inserted, {} updated, {} row(s) in {}",
            stats.inserted,
            stats.updated,
            stats.row_count,
            layout.qualified_name()
        ))
        .with_metadata("silver_hash", silver.reference.content_hash)
        .with_metadata("table", layout.qualified_name())
        .with_metadata("inserted", stats.inserted)
        .with_metadata("updated", stats.updated)
        .with_metadata("row_count", stats.row_count))
    }
}
