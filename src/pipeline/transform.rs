//! Silver transform: decode, parse, validate and coerce the latest bronze
//! snapshot

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{StageOutcome, retry_storage};
use crate::contract::{ColumnSpec, DatasetContract, QualityRule, RuleCheck, SemanticType, Severity};
use crate::decode::decode;
use crate::error::{NotFoundError, PipelineError, StorageError, ValidationError};
use crate::parsers::{ParsedTable, ParserRegistry};
use crate::retry::{RetryPolicy, Sleeper};
use crate::stage::{Attributes, ObjectStage, Stage, content_hash};

/// Column descriptor of a silver snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilverColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: SemanticType,
    pub nullable: bool,
}

/// Silver payload: typed rows in schema column order
///
/// Dates are `YYYY-MM-DD` strings and timestamps `YYYY-MM-DD HH:MM:SS` (UTC).
/// The bronze hash is part of the payload, so a silver object's content hash
/// changes whenever its bronze input does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilverTable {
    pub dataset_id: String,
    /// Content hash of the bronze object this table was derived from
    #[serde(default)]
    pub bronze_hash: Option<String>,
    pub columns: Vec<SilverColumn>,
    pub rows: Vec<Vec<Value>>,
}

impl SilverTable {
    /// Serialized payload; equal tables give equal bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A row excluded from silver and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRow {
    /// 1-based position among parsed data rows
    pub row_number: usize,
    pub rule: String,
    pub column: Option<String>,
    pub reason: String,
}

/// Row accounting for one transform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub rows_read: usize,
    pub rows_accepted: usize,
    pub rows_quarantined: usize,
    pub quarantined: Vec<QuarantinedRow>,
    /// Violations per rule name, including `required`, `type` and
    /// `primary_key`
    pub rule_violations: BTreeMap<String, usize>,
}

impl ValidationReport {
    fn quarantine(&mut self, row: QuarantinedRow) {
        *self.rule_violations.entry(row.rule.clone()).or_default() += 1;
        self.quarantined.push(row);
    }

    /// Reasons recorded for a row, if it was quarantined
    pub fn reason_for(&self, row_number: usize) -> Option<&str> {
        self.quarantined
            .iter()
            .find(|q| q.row_number == row_number)
            .map(|q| q.reason.as_str())
    }
}

/// Contract applied to a parsed table
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub table: SilverTable,
    pub report: ValidationReport,
}

/// Compiled row rule bound to its column position
struct RowRule<'c> {
    rule: &'c QualityRule,
    column: usize,
    regex: Option<Regex>,
}

impl RowRule<'_> {
    fn column_name(&self) -> Option<String> {
        self.rule.check.columns().first().map(|c| c.to_string())
    }

    /// Violation reason, or `None` when the value passes
    fn check(&self, cells: &[Option<String>]) -> Option<String> {
        let value = cells.get(self.column).and_then(|c| c.as_deref());
        match &self.rule.check {
            RuleCheck::NotEmpty { .. } => value.is_none().then(|| "value is empty".to_string()),
            RuleCheck::Pattern { regex, .. } => {
                let value = value?;
                let compiled = self.regex.as_ref()?;
                (!compiled.is_match(value))
                    .then(|| format!("'{}' does not match pattern {}", value, regex))
            }
            RuleCheck::OneOf { values, .. } => {
                let value = value?;
                (!values.iter().any(|allowed| allowed == value))
                    .then(|| format!("'{}' is not one of: {}", value, values.join(", ")))
            }
            RuleCheck::Length { min, max, .. } => {
                let length = value?.chars().count();
                let (min, max) = (*min, *max);
                (min.is_some_and(|m| length < m) || max.is_some_and(|m| length > m))
                    .then(|| format!("length {} is outside {}", length, bounds(min, max)))
            }
            RuleCheck::Range { min, max, .. } => {
                let value = value?;
                let (min, max) = (*min, *max);
                match parse_number(value) {
                    None => Some(format!("'{}' is not numeric", value)),
                    Some(n) if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) => {
                        Some(format!("{} is outside {}", value, bounds(min, max)))
                    }
                    Some(_) => None,
                }
            }
            RuleCheck::Unique { .. } | RuleCheck::MinRows { .. } => None,
        }
    }
}

fn bounds<T: Display>(min: Option<T>, max: Option<T>) -> String {
    let show = |b: Option<T>| b.map(|v| v.to_string()).unwrap_or_default();
    format!("[{}..{}]", show(min), show(max))
}

/// Number with either `.` or `,` as the decimal separator
fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    let parsed = if text.contains(',') && !text.contains('.') {
        text.replacen(',', ".", 1).parse::<f64>()
    } else {
        text.parse::<f64>()
    };
    parsed.ok().filter(|n| n.is_finite())
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d.%m.%Y"];

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc).naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Coerce a non-empty cell to its semantic type
pub(crate) fn coerce(column_type: SemanticType, text: &str) -> Result<Value, String> {
    let invalid = || format!("cannot parse '{}' as {}", text, column_type);
    match column_type {
        SemanticType::String => Ok(Value::String(text.to_string())),
        SemanticType::Integer => text.parse::<i64>().map(Value::from).map_err(|_| invalid()),
        SemanticType::Float => parse_number(text)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(invalid),
        SemanticType::Boolean => match text.to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "oui" => Ok(Value::Bool(true)),
            "false" | "no" | "n" | "0" | "non" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        SemanticType::Date => parse_date(text)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(invalid),
        SemanticType::Timestamp => parse_timestamp(text)
            .map(|t| Value::String(t.format("%Y-%m-%d %H:%M:%S").to_string()))
            .ok_or_else(invalid),
    }
}

/// Trim, apply the column's normalizers, and turn empty into null
fn normalize_cell(column: &ColumnSpec, raw: &str) -> Option<String> {
    let mut value = raw.trim().to_string();
    for step in &column.normalize {
        value = step.apply(&value);
    }
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Position of each schema column among the observed columns
fn map_columns(contract: &DatasetContract, observed: &[String]) -> Result<Vec<Option<usize>>, Vec<String>> {
    let canonical: Vec<String> = observed
        .iter()
        .map(|raw| contract.naming_rule.canonical(raw))
        .collect();
    let mut mapping = Vec::with_capacity(contract.schema.len());
    let mut missing = Vec::new();
    for column in &contract.schema {
        let position = canonical.iter().position(|c| c == &column.name);
        if position.is_none() {
            if contract.is_required(column) {
                missing.push(column.name.clone());
            } else {
                warn!(
                    dataset_id = %contract.dataset_id,
                    column = %column.name,
                    "Optional column absent from source, filling with nulls"
                );
            }
        }
        mapping.push(position);
    }
    if missing.is_empty() {
        Ok(mapping)
    } else {
        Err(missing)
    }
}

fn schema_position(contract: &DatasetContract, column: &str) -> Option<usize> {
    contract.schema.iter().position(|c| c.name == column)
}

/// Duplicate detection key over coerced values
fn row_key(values: &[Value], positions: &[usize]) -> String {
    let key: Vec<&Value> = positions.iter().filter_map(|&i| values.get(i)).collect();
    serde_json::to_string(&key).unwrap_or_default()
}

/// Apply a contract's normalization, quality rules and coercion to parsed rows
///
/// Row rules run in declared order. The first `reject_row` violation
/// quarantines the row and ends rule evaluation for it; `fail_dataset`
/// violations are counted across all rows and abort the transform once the
/// rows are scanned. Rows that pass are coerced; rows repeating an accepted
/// primary key are quarantined. Dataset rules run last over accepted rows.
pub fn apply_contract(
    contract: &DatasetContract,
    parsed: &ParsedTable,
) -> Result<Validated, ValidationError> {
    let invalid = |rule: &str, offending_rows: usize, reason: String| ValidationError {
        dataset_id: contract.dataset_id.clone(),
        rule: rule.to_string(),
        offending_rows,
        reason,
    };

    let mapping = map_columns(contract, &parsed.columns).map_err(|missing| {
        invalid(
            "schema",
            0,
            format!(
                "source is missing required column(s): {} (observed: {})",
                missing.join(", "),
                parsed.columns.join(", ")
            ),
        )
    })?;

    let mut row_rules = Vec::new();
    for rule in contract.quality_rules.iter().filter(|r| r.check.is_row_rule()) {
        let column = rule
            .check
            .columns()
            .first()
            .and_then(|c| schema_position(contract, c))
            .ok_or_else(|| invalid(&rule.name, 0, "rule column is not in the schema".to_string()))?;
        let regex = match &rule.check {
            RuleCheck::Pattern { regex, .. } => Some(
                Regex::new(regex).map_err(|e| invalid(&rule.name, 0, format!("invalid regex: {}", e)))?,
            ),
            _ => None,
        };
        row_rules.push(RowRule { rule, column, regex });
    }

    let key_positions: Vec<usize> = contract
        .primary_key
        .iter()
        .filter_map(|k| schema_position(contract, k))
        .collect();

    let mut report = ValidationReport {
        rows_read: parsed.rows.len(),
        ..Default::default()
    };
    // rule position -> (offending rows, first reason)
    let mut fatal: BTreeMap<usize, (usize, String)> = BTreeMap::new();
    let mut accepted: Vec<(usize, Vec<Value>)> = Vec::new();
    let mut seen_keys = HashSet::new();

    'rows: for (index, raw) in parsed.rows.iter().enumerate() {
        let row_number = index + 1;
        let cells: Vec<Option<String>> = contract
            .schema
            .iter()
            .zip(&mapping)
            .map(|(column, position)| {
                position
                    .and_then(|i| raw.get(i))
                    .and_then(|cell| normalize_cell(column, cell))
            })
            .collect();

        for (position, rule) in row_rules.iter().enumerate() {
            let Some(reason) = rule.check(&cells) else {
                continue;
            };
            match rule.rule.severity {
                Severity::FailDataset => {
                    fatal.entry(position).or_insert((0, reason)).0 += 1;
                }
                Severity::RejectRow => {
                    report.quarantine(QuarantinedRow {
                        row_number,
                        rule: rule.rule.name.clone(),
                        column: rule.column_name(),
                        reason,
                    });
                    continue 'rows;
                }
            }
        }

        let mut values = Vec::with_capacity(cells.len());
        for (column, cell) in contract.schema.iter().zip(cells) {
            let coerced = match cell {
                None if contract.is_required(column) => {
                    Err(("required", "required field empty".to_string()))
                }
                None => Ok(Value::Null),
                Some(text) => coerce(column.column_type, &text).map_err(|reason| ("type", reason)),
            };
            match coerced {
                Ok(value) => values.push(value),
                Err((rule, reason)) => {
                    report.quarantine(QuarantinedRow {
                        row_number,
                        rule: rule.to_string(),
                        column: Some(column.name.clone()),
                        reason,
                    });
                    continue 'rows;
                }
            }
        }

        if !seen_keys.insert(row_key(&values, &key_positions)) {
            report.quarantine(QuarantinedRow {
                row_number,
                rule: "primary_key".to_string(),
                column: None,
                reason: "duplicate primary key".to_string(),
            });
            continue;
        }
        accepted.push((row_number, values));
    }

    if let Some((position, (count, reason))) = fatal.into_iter().next() {
        return Err(invalid(&row_rules[position].rule.name, count, reason));
    }

    for rule in contract.quality_rules.iter().filter(|r| !r.check.is_row_rule()) {
        match &rule.check {
            RuleCheck::Unique { columns } => {
                let positions: Vec<usize> = columns
                    .iter()
                    .filter_map(|c| schema_position(contract, c))
                    .collect();
                let mut seen = HashSet::new();
                let duplicates: HashSet<usize> = accepted
                    .iter()
                    .filter(|(_, values)| !seen.insert(row_key(values, &positions)))
                    .map(|(row_number, _)| *row_number)
                    .collect();
                if duplicates.is_empty() {
                    continue;
                }
                let reason = format!("duplicate value for ({})", columns.join(", "));
                if rule.severity == Severity::FailDataset {
                    return Err(invalid(&rule.name, duplicates.len(), reason));
                }
                accepted.retain(|(row_number, _)| !duplicates.contains(row_number));
                let mut rows: Vec<usize> = duplicates.into_iter().collect();
                rows.sort_unstable();
                for row_number in rows {
                    report.quarantine(QuarantinedRow {
                        row_number,
                        rule: rule.name.clone(),
                        column: None,
                        reason: reason.clone(),
                    });
                }
            }
            RuleCheck::MinRows { count } => {
                if accepted.len() < *count {
                    return Err(invalid(
                        &rule.name,
                        count - accepted.len(),
                        format!("{} row(s) accepted, at least {} required", accepted.len(), count),
                    ));
                }
            }
            _ => {}
        }
    }

    report.quarantined.sort_by_key(|q| q.row_number);
    report.rows_accepted = accepted.len();
    report.rows_quarantined = report.quarantined.len();

    let table = SilverTable {
        dataset_id: contract.dataset_id.clone(),
        bronze_hash: None,
        columns: contract
            .schema
            .iter()
            .map(|c| SilverColumn {
                name: c.name.clone(),
                column_type: c.column_type,
                nullable: !contract.is_required(c),
            })
            .collect(),
        rows: accepted.into_iter().map(|(_, values)| values).collect(),
    };
    Ok(Validated { table, report })
}

/// Turns the latest bronze snapshot into a silver snapshot
pub struct TransformPipeline<'a> {
    stage: &'a dyn ObjectStage,
    registry: &'a ParserRegistry,
    retry: &'a RetryPolicy,
    sleeper: &'a dyn Sleeper,
}

impl<'a> TransformPipeline<'a> {
    pub fn new(
        stage: &'a dyn ObjectStage,
        registry: &'a ParserRegistry,
        retry: &'a RetryPolicy,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            stage,
            registry,
            retry,
            sleeper,
        }
    }

    pub fn run(&self, contract: &DatasetContract) -> Result<StageOutcome, PipelineError> {
        let dataset_id = contract.dataset_id.as_str();
        let invalid = |rule: &str, reason: String| ValidationError {
            dataset_id: dataset_id.to_string(),
            rule: rule.to_string(),
            offending_rows: 0,
            reason,
        };

        let _lock = self.stage.lock(dataset_id, Stage::Silver)?;
        let bronze = self
            .stage
            .get_latest(dataset_id, Stage::Bronze)?
            .ok_or_else(|| NotFoundError {
                dataset_id: dataset_id.to_string(),
                stage: Stage::Bronze,
            })?;

        let decoded =
            decode(&bronze.payload, contract.encoding).map_err(|e| invalid("decode", e.to_string()))?;
        let parser = self.registry.resolve(contract)?;
        let parsed = (parser.parse)(&decoded.text).map_err(|e| invalid("parse", e.to_string()))?;
        if parsed.is_empty() {
            return Err(invalid("parse", "parsed 0 rows".to_string()).into());
        }

        let Validated { mut table, report } = apply_contract(contract, &parsed)?;
        table.bronze_hash = Some(bronze.reference.content_hash.clone());
        if report.rows_quarantined > 0 {
            warn!(
                dataset_id,
                rows_quarantined = report.rows_quarantined,
                rows_read = report.rows_read,
                "Rows quarantined"
            );
        }

        let payload = table.to_bytes()?;
        let hash = content_hash(&payload);
        let latest = self.stage.latest_pointer(dataset_id, Stage::Silver)?;
        if latest.is_some_and(|p| p.content_hash == hash) {
            info!(
                dataset_id,
                content_hash = %hash,
                "Silver already derived from the latest bronze, skipping write"
            );
            return Ok(
                StageOutcome::skipped("silver snapshot already derived from the latest bronze")
                    .with_metadata("content_hash", hash)
                    .with_metadata("rows_accepted", report.rows_accepted as u64),
            );
        }

        let transformed_at = Utc::now();
        let mut attributes = Attributes::new();
        attributes.insert(
            "validation_report".to_string(),
            serde_json::to_value(&report).map_err(StorageError::from)?,
        );
        attributes.insert(
            "bronze_hash".to_string(),
            bronze.reference.content_hash.clone().into(),
        );
        attributes.insert("bronze_key".to_string(), bronze.reference.key().into());
        attributes.insert("source".to_string(), contract.source.clone().into());
        attributes.insert("parser".to_string(), parser.name.into());
        attributes.insert("encoding".to_string(), decoded.encoding.name().into());
        attributes.insert("transformed_at".to_string(), transformed_at.to_rfc3339().into());
        attributes.insert("row_count".to_string(), (table.row_count() as u64).into());

        let partition_key = contract.partition_rule.partition_key(transformed_at);
        let reference = retry_storage(self.retry, self.sleeper, || {
            self.stage.put(
                dataset_id,
                Stage::Silver,
                &partition_key,
                &payload,
                attributes.clone(),
            )
        })?;
        let pointer = retry_storage(self.retry, self.sleeper, || {
            self.stage.advance_latest(&reference)
        })?;

        info!(
            dataset_id,
            key = %pointer.key,
            rows_read = report.rows_read,
            rows_accepted = report.rows_accepted,
            rows_quarantined = report.rows_quarantined,
            "Silver snapshot committed"
        );
        Ok(StageOutcome::succeeded(format!(
            "{} of {} row(s) accepted, {} quarantined",
            report.rows_accepted, report.rows_read, report.rows_quarantined
        ))
        .with_metadata("content_hash", hash)
        .with_metadata("key", pointer.key)
        .with_metadata("bronze_hash", bronze.reference.content_hash)
        .with_metadata("rows_read", report.rows_read as u64)
        .with_metadata("rows_accepted", report.rows_accepted as u64)
        .with_metadata("rows_quarantined", report.rows_quarantined as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Normalizer;
    use proptest::prelude::*;

    fn rule(name: &str, check: RuleCheck, severity: Severity) -> QualityRule {
        QualityRule {
            name: name.to_string(),
            check,
            severity,
        }
    }

    fn contract() -> DatasetContract {
        DatasetContract::new(
            "guides",
            "file:///tmp/guides.txt",
            vec![
                ColumnSpec::new("last_name", SemanticType::String)
                    .with_normalize(vec![Normalizer::CollapseWhitespace, Normalizer::Uppercase]),
                ColumnSpec::new("first_name", SemanticType::String)
                    .with_normalize(vec![Normalizer::Titlecase]),
                ColumnSpec::new("city", SemanticType::String).required(),
                ColumnSpec::new("licences", SemanticType::Integer),
            ],
            vec!["last_name".to_string(), "first_name".to_string()],
        )
    }

    fn table(columns: &[&str], rows: &[&[&str]]) -> ParsedTable {
        ParsedTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    const COLUMNS: &[&str] = &["last_name", "first_name", "city", "licences"];

    #[test]
    fn test_normalizes_and_coerces() {
        let parsed = table(COLUMNS, &[&["  du   pont ", "jean-luc", " Lyon ", "3"]]);
        let validated = apply_contract(&contract(), &parsed).unwrap();
        assert_eq!(
            validated.table.rows,
            vec![vec![
                Value::from("DU PONT"),
                Value::from("Jean-Luc"),
                Value::from("Lyon"),
                Value::from(3),
            ]]
        );
        assert_eq!(validated.report.rows_accepted, 1);
        assert!(!validated.table.columns[2].nullable);
        assert!(!validated.table.columns[0].nullable);
        assert!(validated.table.columns[3].nullable);
    }

    #[test]
    fn test_empty_required_and_bad_type_quarantined() {
        let parsed = table(
            COLUMNS,
            &[
                &["Dupont", "Marie", "", "1"],
                &["Martin", "Paul", "Nice", "many"],
                &["Leroy", "Anne", "Paris", ""],
            ],
        );
        let validated = apply_contract(&contract(), &parsed).unwrap();
        let report = &validated.report;
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.rows_accepted, 1);
        assert_eq!(report.rows_quarantined, 2);
        assert_eq!(report.reason_for(1), Some("required field empty"));
        assert_eq!(report.quarantined[0].column.as_deref(), Some("city"));
        assert_eq!(report.reason_for(2), Some("cannot parse 'many' as integer"));
        assert_eq!(report.rule_violations["required"], 1);
        assert_eq!(report.rule_violations["type"], 1);
        assert_eq!(validated.table.rows[0][3], Value::Null);
    }

    #[test]
    fn test_duplicate_primary_key_quarantined() {
        let parsed = table(
            COLUMNS,
            &[&["Dupont", "Marie", "Lyon", ""], &["DUPONT", "marie", "Nice", ""]],
        );
        let validated = apply_contract(&contract(), &parsed).unwrap();
        assert_eq!(validated.report.rows_accepted, 1);
        assert_eq!(validated.report.reason_for(2), Some("duplicate primary key"));
        assert_eq!(validated.table.rows[0][2], Value::from("Lyon"));
    }

    #[test]
    fn test_reject_row_records_first_violation_only() {
        let contract = contract().with_quality_rules(vec![
            rule(
                "city_known",
                RuleCheck::OneOf {
                    column: "city".to_string(),
                    values: vec!["Lyon".to_string(), "Paris".to_string()],
                },
                Severity::RejectRow,
            ),
            rule(
                "city_short",
                RuleCheck::Length {
                    column: "city".to_string(),
                    min: None,
                    max: Some(3),
                },
                Severity::RejectRow,
            ),
        ]);
        let parsed = table(COLUMNS, &[&["A", "B", "Marseille", ""], &["C", "D", "Lyon", ""]]);
        let validated = apply_contract(&contract, &parsed).unwrap();
        let report = &validated.report;
        assert_eq!(report.rows_quarantined, 2);
        assert_eq!(report.quarantined[0].rule, "city_known");
        assert_eq!(report.quarantined[1].rule, "city_short");
        assert_eq!(report.rule_violations.get("city_short"), Some(&1));
        assert_eq!(report.rows_accepted, 0);
    }

    #[test]
    fn test_fail_dataset_counts_offending_rows() {
        let contract = contract().with_quality_rules(vec![rule(
            "licences_range",
            RuleCheck::Range {
                column: "licences".to_string(),
                min: Some(0.0),
                max: Some(10.0),
            },
            Severity::FailDataset,
        )]);
        let parsed = table(
            COLUMNS,
            &[
                &["A", "B", "Lyon", "12"],
                &["C", "D", "Lyon", "4"],
                &["E", "F", "Lyon", "-1"],
            ],
        );
        let err = apply_contract(&contract, &parsed).unwrap_err();
        assert_eq!(err.rule, "licences_range");
        assert_eq!(err.offending_rows, 2);
    }

    #[test]
    fn test_dataset_rules() {
        let unique = rule(
            "one_guide_per_city",
            RuleCheck::Unique {
                columns: vec!["city".to_string()],
            },
            Severity::RejectRow,
        );
        let parsed = table(
            COLUMNS,
            &[&["A", "B", "Lyon", ""], &["C", "D", "Lyon", ""], &["E", "F", "Nice", ""]],
        );
        let validated = apply_contract(&contract().with_quality_rules(vec![unique]), &parsed).unwrap();
        assert_eq!(validated.report.rows_accepted, 2);
        assert_eq!(validated.report.quarantined[0].row_number, 2);

        let min_rows = rule("enough", RuleCheck::MinRows { count: 5 }, Severity::FailDataset);
        let err = apply_contract(&contract().with_quality_rules(vec![min_rows]), &parsed).unwrap_err();
        assert_eq!(err.rule, "enough");
        assert!(err.reason.contains("3 row(s) accepted"));
    }

    #[test]
    fn test_missing_required_column_is_schema_drift() {
        let parsed = table(&["last_name", "first_name", "licences"], &[&["A", "B", "1"]]);
        let err = apply_contract(&contract(), &parsed).unwrap_err();
        assert_eq!(err.rule, "schema");
        assert!(err.reason.contains("city"));

        // Optional columns may be absent
        let parsed = table(&["last_name", "first_name", "city"], &[&["A", "B", "Lyon"]]);
        let validated = apply_contract(&contract(), &parsed).unwrap();
        assert_eq!(validated.table.rows[0][3], Value::Null);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(coerce(SemanticType::Float, "3,5").unwrap(), Value::from(3.5));
        assert_eq!(coerce(SemanticType::Boolean, "Oui").unwrap(), Value::Bool(true));
        assert_eq!(coerce(SemanticType::Date, "15/01/2024").unwrap(), Value::from("2024-01-15"));
        assert_eq!(
            coerce(SemanticType::Timestamp, "2024-01-15T10:30:00+02:00").unwrap(),
            Value::from("2024-01-15 08:30:00")
        );
        assert_eq!(
            coerce(SemanticType::Timestamp, "2024-01-15").unwrap(),
            Value::from("2024-01-15 00:00:00")
        );
        assert!(coerce(SemanticType::Float, "NaN").is_err());
        assert!(coerce(SemanticType::Date, "2024-13-01").is_err());
    }

    #[test]
    fn test_silver_bytes_are_deterministic() {
        let parsed = table(COLUMNS, &[&["A", "B", "Lyon", "2"]]);
        let first = apply_contract(&contract(), &parsed).unwrap().table;
        let second = apply_contract(&contract(), &parsed).unwrap().table;
        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
        assert_eq!(SilverTable::from_bytes(&first.to_bytes().unwrap()).unwrap(), first);
    }

    #[test]
    fn test_bronze_lineage_changes_silver_bytes() {
        let parsed = table(COLUMNS, &[&["A", "B", "Lyon", "2"]]);
        let mut first = apply_contract(&contract(), &parsed).unwrap().table;
        let mut second = first.clone();
        first.bronze_hash = Some("aaa".to_string());
        second.bronze_hash = Some("bbb".to_string());
        assert_eq!(first.rows, second.rows);
        assert_ne!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    }

    proptest! {
        #[test]
        fn prop_every_row_is_accepted_or_quarantined(
            rows in prop::collection::vec(
                prop::collection::vec(prop::sample::select(vec!["", " ", "A", "b", "Lyon", "7", "x y", "-3"]), 4),
                0..40,
            )
        ) {
            let contract = contract().with_quality_rules(vec![
                rule(
                    "city_alpha",
                    RuleCheck::Pattern { column: "city".to_string(), regex: "^[A-Za-z ]+$".to_string() },
                    Severity::RejectRow,
                ),
                rule(
                    "name_unique",
                    RuleCheck::Unique { columns: vec!["last_name".to_string()] },
                    Severity::RejectRow,
                ),
            ]);
            let parsed = ParsedTable {
                columns: COLUMNS.iter().map(|c| c.to_string()).collect(),
                rows: rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect(),
            };
            let report = apply_contract(&contract, &parsed).unwrap().report;
            prop_assert_eq!(report.rows_read, rows.len());
            prop_assert_eq!(report.rows_accepted + report.rows_quarantined, report.rows_read);
            prop_assert_eq!(report.quarantined.len(), report.rows_quarantined);
        }
    }
}
