//! Error types for pipeline operations
//!
//! Every stage failure names the dataset and the stage it happened in, so a
//! batch run can report per-dataset diagnoses without halting the others.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::TransitionError;
use crate::stage::Stage;

/// A single structural problem found in a dataset contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Contract field the problem is attached to (e.g. `primary_key`)
    pub field: String,
    /// Human-readable description
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while loading or resolving dataset contracts
#[derive(Error, Debug)]
pub enum ContractError {
    /// Contract file does not exist
    #[error("Contract file not found: {0}")]
    FileNotFound(PathBuf),

    /// Contract file exists but is not a readable contract document
    #[error("Contract file {path} could not be parsed: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// One contract failed structural validation
    #[error("Contract '{dataset_id}' is invalid: {}", join_violations(.violations))]
    Invalid {
        dataset_id: String,
        violations: Vec<Violation>,
    },

    /// No contract with this id was loaded
    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    /// Two parsers were registered under the same name
    #[error("Parser '{0}' is registered more than once")]
    DuplicateParser(String),
}

/// Source unreachable or retries exhausted; the previous bronze is retained
#[derive(Error, Debug)]
#[error("Ingestion of '{dataset_id}' failed after {attempts} attempt(s): {reason}")]
pub struct IngestionError {
    pub dataset_id: String,
    pub attempts: usize,
    pub reason: String,
}

/// A fail-dataset quality rule was violated; no silver object was written
#[derive(Error, Debug)]
#[error(
    "Validation of '{dataset_id}' failed on rule '{rule}' ({offending_rows} offending row(s)): {reason}"
)]
pub struct ValidationError {
    pub dataset_id: String,
    pub rule: String,
    pub offending_rows: usize,
    pub reason: String,
}

/// The upstream stage has never committed an object for this dataset
#[derive(Error, Debug)]
#[error("No {stage} object found for '{dataset_id}'")]
pub struct NotFoundError {
    pub dataset_id: String,
    pub stage: Stage,
}

/// Relational write failed; the transaction was rolled back
#[derive(Error, Debug)]
#[error("Load of '{dataset_id}' into {table} failed: {reason}")]
pub struct LoadError {
    pub dataset_id: String,
    pub table: String,
    pub reason: String,
}

/// Errors reported by object stage backends
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object or pointer does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Stored bytes do not match their recorded hash
    #[error("Corrupt object {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Metadata or pointer could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Lock held by another writer for too long
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    /// Remote backend error
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::Backend(_) | StorageError::LockConflict(_)
        )
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(err.to_string())
        } else {
            StorageError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Top-level error for a pipeline stage invocation
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Invalid settings
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Short machine-friendly classification, used in reports and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Contract(_) => "contract_error",
            PipelineError::Ingestion(_) => "ingestion_error",
            PipelineError::Validation(_) => "validation_error",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Load(_) => "load_error",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::Transition(_) => "state_error",
            PipelineError::Config(_) => "config_error",
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Contract(ContractError::Invalid {
                dataset_id,
                violations,
            }) => {
                let mut msg = format!("Contract '{dataset_id}' is invalid:\n");
                for v in violations {
                    msg.push_str(&format!("  - {v}\n"));
                }
                msg.push_str("\nHint: Fix the contract and run 'mpdp show-sources' to re-check.");
                msg
            }
            PipelineError::Contract(ContractError::UnknownDataset(id)) => {
                format!(
                    "Unknown dataset: {id}\n\nHint: Run 'mpdp show-sources' to list declared datasets."
                )
            }
            PipelineError::Ingestion(e) => {
                format!("{e}\n\nHint: Check the source URL and network connectivity.")
            }
            PipelineError::Validation(e) => {
                format!(
                    "{e}\n\nHint: The previous silver snapshot is still current; inspect the bronze object."
                )
            }
            PipelineError::NotFound(e) => {
                let prior = match e.stage {
                    Stage::Bronze => "ingest",
                    Stage::Silver => "transform",
                };
                format!(
                    "{e}\n\nHint: Run 'mpdp {prior} {}' first.",
                    e.dataset_id
                )
            }
            PipelineError::Load(e) => {
                format!("{e}\n\nHint: The staging table was left unchanged.")
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_lists_violations() {
        let err = ContractError::Invalid {
            dataset_id: "guides".to_string(),
            violations: vec![
                Violation::new("primary_key", "missing required field"),
                Violation::new("partition_rule", "unknown rule 'hourly'"),
            ],
        };
        let display = err.to_string();
        assert!(display.contains("guides"));
        assert!(display.contains("primary_key: missing required field"));
        assert!(display.contains("partition_rule"));
    }

    #[test]
    fn test_not_found_hint_names_prior_stage() {
        let err = PipelineError::from(NotFoundError {
            dataset_id: "guides".to_string(),
            stage: Stage::Silver,
        });
        let msg = err.user_message();
        assert!(msg.contains("No silver object found for 'guides'"));
        assert!(msg.contains("mpdp transform guides"));
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError {
            dataset_id: "guides".to_string(),
            rule: "city_known".to_string(),
            offending_rows: 1,
            reason: "value not allowed".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("city_known"));
        assert!(display.contains("1 offending row"));
    }

    #[test]
    fn test_storage_error_retryable() {
        assert!(StorageError::Io("disk full".to_string()).is_retryable());
        assert!(
            !StorageError::Corrupt {
                key: "k".to_string(),
                reason: "hash".to_string()
            }
            .is_retryable()
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(StorageError::from(io), StorageError::NotFound(_)));
    }
}
