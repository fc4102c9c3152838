//! Dataset contract types

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decode::Encoding;

/// Semantic column type; drives coercion and the relational column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
}

impl SemanticType {
    pub fn name(&self) -> &'static str {
        match self {
            SemanticType::String => "string",
            SemanticType::Integer => "integer",
            SemanticType::Float => "float",
            SemanticType::Boolean => "boolean",
            SemanticType::Date => "date",
            SemanticType::Timestamp => "timestamp",
        }
    }

    /// Column type in the staging table
    pub fn sql_type(&self) -> &'static str {
        match self {
            SemanticType::String => "VARCHAR",
            SemanticType::Integer => "BIGINT",
            SemanticType::Float => "DOUBLE PRECISION",
            SemanticType::Boolean => "BOOLEAN",
            SemanticType::Date => "DATE",
            SemanticType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Value normalization step applied before quality rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    Trim,
    CollapseWhitespace,
    Lowercase,
    Uppercase,
    /// Uppercase the first letter of every word, lowercase the rest
    Titlecase,
}

impl Normalizer {
    pub fn apply(&self, value: &str) -> String {
        match self {
            Normalizer::Trim => value.trim().to_string(),
            Normalizer::CollapseWhitespace => value.split_whitespace().collect::<Vec<_>>().join(" "),
            Normalizer::Lowercase => value.to_lowercase(),
            Normalizer::Uppercase => value.to_uppercase(),
            Normalizer::Titlecase => titlecase(value),
        }
    }
}

fn titlecase(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut at_word_start = true;
    for c in value.chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            // "Jean-Luc", "D'Arc"
            at_word_start = c.is_whitespace() || c == '-' || c == '\'';
        }
    }
    out
}

fn default_true() -> bool {
    true
}

/// One expected column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: SemanticType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub normalize: Vec<Normalizer>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            normalize: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_normalize(mut self, steps: Vec<Normalizer>) -> Self {
        self.normalize = steps;
        self
    }
}

/// Case style applied to raw column names without an explicit rename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameCase {
    #[default]
    Preserve,
    Lowercase,
    SnakeCase,
}

/// Maps raw observed column names to canonical schema names
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamingRule {
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    #[serde(default)]
    pub case: NameCase,
}

impl NamingRule {
    /// Canonical name for a raw column name
    pub fn canonical(&self, raw: &str) -> String {
        let raw = raw.trim();
        if let Some(renamed) = self.renames.get(raw) {
            return renamed.clone();
        }
        match self.case {
            NameCase::Preserve => raw.to_string(),
            NameCase::Lowercase => raw.to_lowercase(),
            NameCase::SnakeCase => snake_case(raw),
        }
    }
}

fn snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_lower = false;
    for c in raw.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = c.is_lowercase() || c.is_numeric();
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Time bucketing of snapshots by creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRule {
    None,
    Daily,
    Monthly,
    Yearly,
}

impl PartitionRule {
    /// Partition key for an object created at `at`
    pub fn partition_key(&self, at: DateTime<Utc>) -> String {
        match self {
            PartitionRule::None => "all".to_string(),
            PartitionRule::Daily => at.format("%Y-%m-%d").to_string(),
            PartitionRule::Monthly => at.format("%Y-%m").to_string(),
            PartitionRule::Yearly => at.format("%Y").to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PartitionRule::None => "none",
            PartitionRule::Daily => "daily",
            PartitionRule::Monthly => "monthly",
            PartitionRule::Yearly => "yearly",
        }
    }
}

/// What happens when a quality rule is violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Quarantine the row and continue
    RejectRow,
    /// Abort the transform; no silver is written
    FailDataset,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::RejectRow => write!(f, "reject_row"),
            Severity::FailDataset => write!(f, "fail_dataset"),
        }
    }
}

/// Check performed by a quality rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleCheck {
    /// Value must be present
    NotEmpty { column: String },
    /// Value, when present, must match the regex
    Pattern { column: String, regex: String },
    /// Value, when present, must be one of `values`
    OneOf { column: String, values: Vec<String> },
    /// Character length bounds, inclusive
    Length {
        column: String,
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    /// Numeric bounds, inclusive
    Range {
        column: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Combination of columns must not repeat across accepted rows
    Unique { columns: Vec<String> },
    /// Accepted row count lower bound
    MinRows { count: usize },
}

impl RuleCheck {
    /// Row rules run per row; dataset rules run over all accepted rows
    pub fn is_row_rule(&self) -> bool {
        !matches!(self, RuleCheck::Unique { .. } | RuleCheck::MinRows { .. })
    }

    /// Columns the check reads
    pub fn columns(&self) -> Vec<&str> {
        match self {
            RuleCheck::NotEmpty { column }
            | RuleCheck::Pattern { column, .. }
            | RuleCheck::OneOf { column, .. }
            | RuleCheck::Length { column, .. }
            | RuleCheck::Range { column, .. } => vec![column.as_str()],
            RuleCheck::Unique { columns } => columns.iter().map(String::as_str).collect(),
            RuleCheck::MinRows { .. } => Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuleCheck::NotEmpty { .. } => "not_empty",
            RuleCheck::Pattern { .. } => "pattern",
            RuleCheck::OneOf { .. } => "one_of",
            RuleCheck::Length { .. } => "length",
            RuleCheck::Range { .. } => "range",
            RuleCheck::Unique { .. } => "unique",
            RuleCheck::MinRows { .. } => "min_rows",
        }
    }
}

/// Named quality rule with its severity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRule {
    pub name: String,
    #[serde(flatten)]
    pub check: RuleCheck,
    pub severity: Severity,
}

/// Declarative description of one dataset
///
/// Built once by the contract store after validation and shared read-only
/// for the rest of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetContract {
    pub dataset_id: String,
    /// Source locator (`https://…`, `file://…` or a path)
    pub source: String,
    pub schema: Vec<ColumnSpec>,
    pub naming_rule: NamingRule,
    pub primary_key: Vec<String>,
    pub partition_rule: PartitionRule,
    pub quality_rules: Vec<QualityRule>,
    /// Registered parser name
    pub parser: String,
    pub encoding: Encoding,
    pub owner: Option<String>,
    pub license: Option<String>,
    /// File extension recorded in bronze metadata
    pub format: String,
    pub staging_schema: String,
    pub staging_table: String,
}

impl DatasetContract {
    /// Contract with defaults for every optional field
    pub fn new(
        dataset_id: impl Into<String>,
        source: impl Into<String>,
        schema: Vec<ColumnSpec>,
        primary_key: Vec<String>,
    ) -> Self {
        let dataset_id = dataset_id.into();
        Self {
            source: source.into(),
            schema,
            naming_rule: NamingRule::default(),
            primary_key,
            partition_rule: PartitionRule::None,
            quality_rules: Vec::new(),
            parser: dataset_id.clone(),
            encoding: Encoding::Auto,
            owner: None,
            license: None,
            format: "bin".to_string(),
            staging_schema: "staging".to_string(),
            staging_table: dataset_id.clone(),
            dataset_id,
        }
    }

    pub fn with_parser(mut self, parser: impl Into<String>) -> Self {
        self.parser = parser.into();
        self
    }

    pub fn with_naming_rule(mut self, naming_rule: NamingRule) -> Self {
        self.naming_rule = naming_rule;
        self
    }

    pub fn with_partition_rule(mut self, rule: PartitionRule) -> Self {
        self.partition_rule = rule;
        self
    }

    pub fn with_quality_rules(mut self, rules: Vec<QualityRule>) -> Self {
        self.quality_rules = rules;
        self
    }

    pub fn with_staging_table(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.staging_schema = schema.into();
        self.staging_table = table.into();
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.schema.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|k| k == column)
    }

    /// Primary-key columns are non-nullable regardless of the schema flag
    pub fn is_required(&self, column: &ColumnSpec) -> bool {
        !column.nullable || self.is_primary_key(&column.name)
    }

    /// Quoted `"schema"."table"` for SQL
    pub fn qualified_table(&self) -> String {
        format!("\"{}\".\"{}\"", self.staging_schema, self.staging_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalizers() {
        assert_eq!(Normalizer::Trim.apply("  a b "), "a b");
        assert_eq!(Normalizer::CollapseWhitespace.apply(" a   b\tc "), "a b c");
        assert_eq!(Normalizer::Lowercase.apply("NÎMES"), "nîmes");
        assert_eq!(Normalizer::Uppercase.apply("dupont"), "DUPONT");
        assert_eq!(Normalizer::Titlecase.apply("jean-luc DE la FONTAINE"), "Jean-Luc De La Fontaine");
    }

    #[test]
    fn test_naming_rule() {
        let mut renames = BTreeMap::new();
        renames.insert("ville".to_string(), "city".to_string());
        let rule = NamingRule {
            renames,
            case: NameCase::SnakeCase,
        };
        assert_eq!(rule.canonical("ville"), "city");
        assert_eq!(rule.canonical("Langue de travail"), "langue_de_travail");
        assert_eq!(rule.canonical("FirstName"), "first_name");
        assert_eq!(rule.canonical(" Code-Postal "), "code_postal");

        let preserve = NamingRule::default();
        assert_eq!(preserve.canonical("Nom"), "Nom");
    }

    #[test]
    fn test_partition_keys() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();
        assert_eq!(PartitionRule::None.partition_key(at), "all");
        assert_eq!(PartitionRule::Daily.partition_key(at), "2024-05-01");
        assert_eq!(PartitionRule::Monthly.partition_key(at), "2024-05");
        assert_eq!(PartitionRule::Yearly.partition_key(at), "2024");
    }

    #[test]
    fn test_quality_rule_yaml_shape() {
        let rule: QualityRule = serde_yaml::from_str(
            "name: city_known\nrule: one_of\ncolumn: city\nvalues: [Paris, Lyon]\nseverity: fail_dataset\n",
        )
        .unwrap();
        assert_eq!(rule.severity, Severity::FailDataset);
        assert_eq!(rule.check.kind(), "one_of");
        assert!(rule.check.is_row_rule());
        assert_eq!(rule.check.columns(), vec!["city"]);

        let min_rows: QualityRule =
            serde_yaml::from_str("name: enough\nrule: min_rows\ncount: 10\nseverity: fail_dataset\n")
                .unwrap();
        assert!(!min_rows.check.is_row_rule());
    }

    #[test]
    fn test_contract_defaults() {
        let contract = DatasetContract::new(
            "guides",
            "https://example.org/guides.txt",
            vec![ColumnSpec::new("id", SemanticType::Integer)],
            vec!["id".to_string()],
        );
        assert_eq!(contract.parser, "guides");
        assert_eq!(contract.staging_schema, "staging");
        assert_eq!(contract.staging_table, "guides");
        assert_eq!(contract.qualified_table(), "\"staging\".\"guides\"");
        let id = contract.column("id").unwrap();
        assert!(id.nullable);
        assert!(contract.is_required(id));
    }
}
