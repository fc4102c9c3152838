//! mpdp - Contract-driven pipeline for public datasets
//!
//! Provides:
//! - Dataset contracts loaded and validated from YAML
//! - Bronze/silver object staging (local filesystem or S3) with latest pointers
//! - Named parsers from decoded text to raw rows
//! - Ingest, transform and load stages with quality rules and quarantine
//! - Transactional upserts into DuckDB or PostgreSQL staging tables

pub mod config;
pub mod contract;
pub mod decode;
pub mod error;
pub mod parsers;
pub mod pipeline;
pub mod relational;
pub mod retry;
pub mod source;
pub mod stage;

// Re-export commonly used types
pub use config::{DatabaseBackend, PipelineSettings, PostgresConnection, StorageBackend};
pub use contract::{
    ColumnSpec, ContractStore, DatasetContract, NamingRule, PartitionRule, QualityRule, RuleCheck,
    SemanticType, Severity,
};
pub use error::{
    ContractError, IngestionError, LoadError, NotFoundError, PipelineError, PipelineResult,
    StorageError, ValidationError, Violation,
};
pub use parsers::{ParsedTable, ParserEntry, ParserRegistry};
pub use pipeline::{
    BatchReport, DatasetReport, Pipeline, PipelineStage, RunStatus, SilverTable, StageReport,
    ValidationReport,
};
#[cfg(feature = "duckdb-backend")]
pub use relational::DuckDbStore;
#[cfg(feature = "postgres-backend")]
pub use relational::PostgresStore;
pub use relational::{RelationalStore, TableLayout};
pub use retry::{RetryPolicy, Sleeper};
pub use source::{SourceFetcher, SourceLocator};
pub use stage::{LatestPointer, LocalObjectStage, ObjectRef, ObjectStage, Stage, StagedObject};
#[cfg(feature = "s3")]
pub use stage::{S3ObjectStage, S3StageConfig};
