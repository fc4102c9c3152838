//! Stage pipelines and the per-dataset runner
//!
//! Each stage reads the latest committed object of the stage before it and
//! commits its own output by advancing a latest pointer. A failed stage never
//! touches committed state.

mod ingest;
mod load;
mod runner;
mod transform;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{PipelineError, StorageError};
use crate::retry::{RetryPolicy, Sleeper, retry};

pub use ingest::IngestionPipeline;
pub use load::{LoadPipeline, silver_rows_as_text};
pub use runner::Pipeline;
pub use transform::{
    QuarantinedRow, SilverColumn, SilverTable, TransformPipeline, Validated, ValidationReport,
    apply_contract,
};

/// Retry a storage operation under `policy`, returning the last error
pub(crate) fn retry_storage<T>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut op: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    retry(policy, sleeper, StorageError::is_retryable, |_| op())
        .map(|r| r.value)
        .map_err(|f| f.error)
}

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Fetch the source into bronze
    Ingest,
    /// Parse, validate and coerce bronze into silver
    Transform,
    /// Upsert silver into the staging table
    Load,
}

impl PipelineStage {
    /// All stages in order
    pub fn all() -> Vec<Self> {
        vec![Self::Ingest, Self::Transform, Self::Load]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Transform => "transform",
            Self::Load => "load",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Ingest => "Fetch the source and stage a bronze snapshot",
            Self::Transform => "Parse and validate bronze into a silver snapshot",
            Self::Load => "Upsert the silver snapshot into the staging table",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingest" => Ok(Self::Ingest),
            "transform" => Ok(Self::Transform),
            "load" => Ok(Self::Load),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Status of one stage within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    /// Finished without writing; the committed object was already current
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::Failed)
    }

    /// `Pending -> Running -> {Succeeded, Skipped, Failed}`, plus
    /// `Pending -> Failed` for a stage that could not start
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Skipped)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Rejected status change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// What a stage produced when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    /// `Succeeded` or `Skipped`
    pub status: RunStatus,
    pub message: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StageOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Succeeded,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Record of one stage execution for one dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub run_id: String,
    pub dataset_id: String,
    pub stage: PipelineStage,
    pub status: RunStatus,
    pub message: Option<String>,
    /// `PipelineError::kind()` when failed
    pub error_kind: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn new(run_id: impl Into<String>, dataset_id: impl Into<String>, stage: PipelineStage) -> Self {
        Self {
            run_id: run_id.into(),
            dataset_id: dataset_id.into(),
            stage,
            status: RunStatus::Pending,
            message: None,
            error_kind: None,
            metadata: BTreeMap::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        if next == RunStatus::Running {
            self.started_at = Utc::now();
        }
        if next.is_terminal() {
            self.duration_ms = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
        }
        self.status = next;
        Ok(())
    }

    /// Finish a running stage with its outcome
    pub fn complete(&mut self, outcome: StageOutcome) -> Result<(), TransitionError> {
        self.transition(outcome.status)?;
        self.message = Some(outcome.message);
        self.metadata = outcome.metadata;
        Ok(())
    }

    /// Finish with an error
    pub fn fail(&mut self, error: &PipelineError) -> Result<(), TransitionError> {
        self.transition(RunStatus::Failed)?;
        self.message = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
        Ok(())
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// Stage reports for one dataset in execution order
#[derive(Debug)]
pub struct DatasetReport {
    pub dataset_id: String,
    pub run_id: String,
    pub stages: Vec<StageReport>,
    /// The error that stopped the run, if any
    pub error: Option<PipelineError>,
}

impl DatasetReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.stages.iter().any(StageReport::is_failed)
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Last stage that ran
    pub fn last_status(&self) -> Option<RunStatus> {
        self.stages.last().map(|r| r.status)
    }
}

/// Outcome of a run over every valid contract
#[derive(Debug, Default)]
pub struct BatchReport {
    pub datasets: Vec<DatasetReport>,
    /// Contracts skipped at load time
    pub rejected: Vec<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.datasets.iter().filter(|d| d.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.datasets.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}
