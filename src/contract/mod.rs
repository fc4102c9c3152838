//! Dataset contracts
//!
//! A contract declares everything the pipeline needs to know about one
//! dataset: where it comes from, how to parse it, the expected schema and
//! keys, how snapshots are partitioned, and which quality rules apply.

mod model;
mod store;

pub use model::{
    ColumnSpec, DatasetContract, NameCase, NamingRule, Normalizer, PartitionRule, QualityRule,
    RuleCheck, SemanticType, Severity,
};
pub use store::{
    ContractEntry, ContractStore, RejectedContract, is_sql_identifier, validate_contract,
};
