//! Contract loading and structural validation

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use super::model::{
    ColumnSpec, DatasetContract, NamingRule, PartitionRule, QualityRule, RuleCheck, Severity,
};
use crate::decode::Encoding;
use crate::error::{ContractError, Violation};
use crate::parsers::ParserRegistry;
use crate::source::SourceLocator;

static DATASET_ID_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").unwrap());

static SQL_IDENTIFIER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Keys understood in a dataset entry
const KNOWN_FIELDS: &[&str] = &[
    "dataset_id",
    "id",
    "source",
    "url",
    "schema",
    "naming_rule",
    "primary_key",
    "partition_rule",
    "quality_rules",
    "parser",
    "encoding",
    "owner",
    "license",
    "format",
    "staging_schema",
    "staging_table",
    // Accepted for older catalogue files; storage layout now comes from settings.
    "source_type",
    "lake_bucket",
    "bronze_prefix",
    "silver_prefix",
];

/// Whether `name` is a plain SQL identifier
pub fn is_sql_identifier(name: &str) -> bool {
    SQL_IDENTIFIER_REGEX.is_match(name)
}

/// A contract entry that failed validation
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedContract {
    /// Dataset id, or `entry #N` when the id itself is unusable
    pub dataset_id: String,
    pub violations: Vec<Violation>,
}

impl RejectedContract {
    pub fn to_error(&self) -> ContractError {
        ContractError::Invalid {
            dataset_id: self.dataset_id.clone(),
            violations: self.violations.clone(),
        }
    }
}

/// Outcome for one entry of the contract file, in file order
#[derive(Debug, Clone)]
pub enum ContractEntry {
    Valid(DatasetContract),
    Rejected(RejectedContract),
}

impl ContractEntry {
    pub fn dataset_id(&self) -> &str {
        match self {
            ContractEntry::Valid(contract) => &contract.dataset_id,
            ContractEntry::Rejected(rejected) => &rejected.dataset_id,
        }
    }
}

/// Validated dataset contracts for one run
///
/// A malformed entry is recorded as rejected and does not affect the others.
#[derive(Debug, Clone)]
pub struct ContractStore {
    entries: Vec<ContractEntry>,
    parser_names: BTreeSet<String>,
    path: Option<PathBuf>,
}

impl ContractStore {
    /// Load contracts from a YAML file with a top-level `datasets:` list
    pub fn load(path: &Path, registry: &ParserRegistry) -> Result<Self, ContractError> {
        if !path.exists() {
            return Err(ContractError::FileNotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|e| ContractError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut store = Self::parse(&raw, path, registry)?;
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Load contracts from an in-memory YAML document
    pub fn from_yaml_str(yaml: &str, registry: &ParserRegistry) -> Result<Self, ContractError> {
        Self::parse(yaml, Path::new("<inline>"), registry)
    }

    /// Build a store from contracts constructed in code
    pub fn from_contracts(
        contracts: Vec<DatasetContract>,
        registry: &ParserRegistry,
    ) -> Self {
        let mut store = Self::empty(registry);
        for contract in contracts {
            store.admit(contract);
        }
        store
    }

    fn empty(registry: &ParserRegistry) -> Self {
        Self {
            entries: Vec::new(),
            parser_names: registry.names().into_iter().map(str::to_string).collect(),
            path: None,
        }
    }

    fn parse(yaml: &str, path: &Path, registry: &ParserRegistry) -> Result<Self, ContractError> {
        let parse_error = |reason: String| ContractError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        let document: Value = serde_yaml::from_str(yaml).map_err(|e| parse_error(e.to_string()))?;
        let datasets = match document.get("datasets") {
            Some(Value::Sequence(items)) => items.clone(),
            Some(Value::Null) => Vec::new(),
            _ => return Err(parse_error("expected a top-level `datasets` list".to_string())),
        };

        let mut store = Self::empty(registry);
        for (index, item) in datasets.iter().enumerate() {
            match item {
                Value::Mapping(map) => match build_contract(index, map) {
                    Ok(contract) => store.admit(contract),
                    Err(rejected) => store.reject(rejected),
                },
                _ => store.reject(RejectedContract {
                    dataset_id: format!("entry #{}", index + 1),
                    violations: vec![Violation::new("entry", "expected a mapping")],
                }),
            }
        }
        Ok(store)
    }

    fn admit(&mut self, contract: DatasetContract) {
        let mut violations = self.validate(&contract);
        if self.get(&contract.dataset_id).is_ok() {
            violations.push(Violation::new(
                "dataset_id",
                format!("duplicate dataset id `{}`", contract.dataset_id),
            ));
        }
        if violations.is_empty() {
            tracing::debug!(dataset_id = %contract.dataset_id, "contract accepted");
            self.entries.push(ContractEntry::Valid(contract));
        } else {
            self.reject(RejectedContract {
                dataset_id: contract.dataset_id,
                violations,
            });
        }
    }

    fn reject(&mut self, rejected: RejectedContract) {
        tracing::warn!(
            dataset_id = %rejected.dataset_id,
            violations = rejected.violations.len(),
            "contract rejected"
        );
        self.entries.push(ContractEntry::Rejected(rejected));
    }

    /// Path the store was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Every entry in file order, valid or not
    pub fn entries(&self) -> &[ContractEntry] {
        &self.entries
    }

    /// Valid contracts in file order
    pub fn list(&self) -> Vec<&DatasetContract> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                ContractEntry::Valid(contract) => Some(contract),
                ContractEntry::Rejected(_) => None,
            })
            .collect()
    }

    /// Skipped entries with their violations
    pub fn rejected(&self) -> Vec<&RejectedContract> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                ContractEntry::Rejected(rejected) => Some(rejected),
                ContractEntry::Valid(_) => None,
            })
            .collect()
    }

    /// Look up a valid contract; a rejected id reports its violations
    pub fn get(&self, dataset_id: &str) -> Result<&DatasetContract, ContractError> {
        let mut rejected = None;
        for entry in &self.entries {
            match entry {
                ContractEntry::Valid(contract) if contract.dataset_id == dataset_id => {
                    return Ok(contract);
                }
                ContractEntry::Rejected(r) if r.dataset_id == dataset_id && rejected.is_none() => {
                    rejected = Some(r);
                }
                _ => {}
            }
        }
        match rejected {
            Some(r) => Err(r.to_error()),
            None => Err(ContractError::UnknownDataset(dataset_id.to_string())),
        }
    }

    /// Structural checks on a built contract; empty when valid
    pub fn validate(&self, contract: &DatasetContract) -> Vec<Violation> {
        validate_contract(contract, &self.parser_names)
    }
}

/// Pulls typed fields out of one YAML entry, collecting per-field violations
struct EntryReader<'a> {
    map: &'a Mapping,
    violations: Vec<Violation>,
}

impl<'a> EntryReader<'a> {
    fn raw(&self, names: &[&str]) -> Option<&'a Value> {
        names
            .iter()
            .find_map(|name| self.map.get(*name))
            .filter(|value| !value.is_null())
    }

    fn optional<T: DeserializeOwned>(&mut self, names: &[&str]) -> Option<T> {
        let value = self.raw(names)?;
        match serde_yaml::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.violations.push(Violation::new(names[0], e.to_string()));
                None
            }
        }
    }

    fn required<T: DeserializeOwned>(&mut self, names: &[&str]) -> Option<T> {
        if self.raw(names).is_none() {
            self.violations
                .push(Violation::new(names[0], "missing required field"));
            return None;
        }
        self.optional(names)
    }
}

fn build_contract(index: usize, map: &Mapping) -> Result<DatasetContract, RejectedContract> {
    let mut reader = EntryReader {
        map,
        violations: Vec::new(),
    };

    for key in map.keys() {
        match key.as_str() {
            Some(name) if KNOWN_FIELDS.contains(&name) => {}
            Some(name) => tracing::warn!(entry = index + 1, field = name, "ignoring unknown contract field"),
            None => reader
                .violations
                .push(Violation::new("entry", "field names must be strings")),
        }
    }

    let dataset_id: Option<String> = reader.required(&["dataset_id", "id"]);
    let source: Option<String> = reader.required(&["source", "url"]);
    let schema: Option<Vec<ColumnSpec>> = reader.required(&["schema"]);
    let primary_key: Option<Vec<String>> = reader.required(&["primary_key"]);
    let partition_rule: Option<PartitionRule> = reader.required(&["partition_rule"]);
    let naming_rule: Option<NamingRule> = reader.optional(&["naming_rule"]);
    let quality_rules: Option<Vec<QualityRule>> = reader.optional(&["quality_rules"]);
    let parser: Option<String> = reader.optional(&["parser"]);
    let encoding: Option<String> = reader.optional(&["encoding"]);
    let owner: Option<String> = reader.optional(&["owner"]);
    let license: Option<String> = reader.optional(&["license"]);
    let format: Option<String> = reader.optional(&["format"]);
    let staging_schema: Option<String> = reader.optional(&["staging_schema"]);
    let staging_table: Option<String> = reader.optional(&["staging_table"]);

    let encoding = match encoding.map(|e| e.parse::<Encoding>()) {
        Some(Ok(encoding)) => encoding,
        Some(Err(e)) => {
            reader.violations.push(Violation::new("encoding", e));
            Encoding::Auto
        }
        None => Encoding::Auto,
    };

    let label = dataset_id
        .clone()
        .unwrap_or_else(|| format!("entry #{}", index + 1));

    match (dataset_id, source, schema, primary_key, partition_rule) {
        (Some(dataset_id), Some(source), Some(schema), Some(primary_key), Some(partition_rule))
            if reader.violations.is_empty() =>
        {
            let mut contract = DatasetContract::new(dataset_id, source, schema, primary_key)
                .with_partition_rule(partition_rule)
                .with_naming_rule(naming_rule.unwrap_or_default())
                .with_quality_rules(quality_rules.unwrap_or_default());
            if let Some(parser) = parser {
                contract.parser = parser;
            }
            contract.encoding = encoding;
            contract.owner = owner;
            contract.license = license;
            if let Some(format) = format {
                contract.format = format;
            }
            if let Some(schema) = staging_schema {
                contract.staging_schema = schema;
            }
            if let Some(table) = staging_table {
                contract.staging_table = table;
            }
            Ok(contract)
        }
        _ => Err(RejectedContract {
            dataset_id: label,
            violations: reader.violations,
        }),
    }
}

/// Check the invariants a contract must hold before any stage runs
pub fn validate_contract(
    contract: &DatasetContract,
    parser_names: &BTreeSet<String>,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut violate = |field: &str, message: String| violations.push(Violation::new(field, message));

    if !DATASET_ID_REGEX.is_match(&contract.dataset_id) {
        violate(
            "dataset_id",
            format!(
                "`{}` must contain only lowercase letters, digits and underscores",
                contract.dataset_id
            ),
        );
    }

    if let Err(e) = SourceLocator::parse(&contract.source) {
        violate("source", e.to_string());
    }

    // Schema
    if contract.schema.is_empty() {
        violate("schema", "must declare at least one column".to_string());
    }
    let mut seen = HashSet::new();
    for column in &contract.schema {
        if !is_sql_identifier(&column.name) {
            violate(
                "schema",
                format!("column name `{}` is not a valid identifier", column.name),
            );
        }
        if !seen.insert(column.name.as_str()) {
            violate("schema", format!("column `{}` is declared twice", column.name));
        }
    }
    let declared = |name: &str| contract.column(name).is_some();

    // Primary key
    if contract.primary_key.is_empty() {
        violate("primary_key", "must name at least one column".to_string());
    }
    let mut seen_keys = HashSet::new();
    for key in &contract.primary_key {
        if !declared(key) {
            violate(
                "primary_key",
                format!("primary_key column `{}` is not declared in schema", key),
            );
        }
        if !seen_keys.insert(key.as_str()) {
            violate("primary_key", format!("column `{}` is listed twice", key));
        }
    }

    // Naming rule
    let mut targets = HashSet::new();
    for (raw, target) in &contract.naming_rule.renames {
        if !declared(target) {
            violate(
                "naming_rule",
                format!("rename `{}` -> `{}` targets an undeclared column", raw, target),
            );
        }
        if !targets.insert(target.as_str()) {
            violate(
                "naming_rule",
                format!("more than one raw column is renamed to `{}`", target),
            );
        }
    }

    // Quality rules
    let mut rule_names = HashSet::new();
    for rule in &contract.quality_rules {
        let field = format!("quality_rules.{}", rule.name);
        if rule.name.trim().is_empty() {
            violate("quality_rules", "rule name must not be empty".to_string());
        } else if !rule_names.insert(rule.name.as_str()) {
            violate("quality_rules", format!("rule `{}` is declared twice", rule.name));
        }
        for column in rule.check.columns() {
            if !declared(column) {
                violate(&field, format!("references undeclared column `{}`", column));
            }
        }
        match &rule.check {
            RuleCheck::Pattern { regex, .. } => {
                if let Err(e) = Regex::new(regex) {
                    violate(&field, format!("invalid regex: {}", e));
                }
            }
            RuleCheck::OneOf { values, .. } if values.is_empty() => {
                violate(&field, "one_of needs at least one value".to_string());
            }
            RuleCheck::Length {
                min: Some(min),
                max: Some(max),
                ..
            } if min > max => {
                violate(&field, format!("min {} is greater than max {}", min, max));
            }
            RuleCheck::Range {
                min: Some(min),
                max: Some(max),
                ..
            } if min > max => {
                violate(&field, format!("min {} is greater than max {}", min, max));
            }
            RuleCheck::Unique { columns } if columns.is_empty() => {
                violate(&field, "unique needs at least one column".to_string());
            }
            RuleCheck::MinRows { .. } if rule.severity != Severity::FailDataset => {
                violate(&field, "min_rows must have severity fail_dataset".to_string());
            }
            _ => {}
        }
    }

    // Parser
    if !parser_names.contains(&contract.parser) {
        violate(
            "parser",
            format!("no parser registered under '{}'", contract.parser),
        );
    }

    // Relational target
    for (field, value) in [
        ("staging_schema", &contract.staging_schema),
        ("staging_table", &contract.staging_table),
    ] {
        if !is_sql_identifier(value) {
            violate(field, format!("`{}` is not a valid identifier", value));
        }
    }

    violations
}
