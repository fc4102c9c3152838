//! Parser registry
//!
//! Parsers are pure functions from decoded text to raw rows. The registry is
//! a table of named function pointers, validated once at startup: names are
//! unique and every contract resolves to exactly one entry.

mod delimited;
mod jsonl;
mod tourism_guides;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::contract::DatasetContract;
use crate::error::ContractError;

pub use delimited::{parse_csv, parse_delimited, parse_semicolon, parse_tsv};
pub use jsonl::parse_jsonl;
pub use tourism_guides::{TOURISM_GUIDES_COLUMNS, parse_tourism_guides};

/// Raw parser output: observed column names and one string per cell
///
/// Every row has exactly `columns.len()` cells. Empty cells are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ParsedTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a row, padding or rejecting it to match the column count
    pub(crate) fn push_row(&mut self, mut row: Vec<String>, line: usize) -> Result<(), ParseError> {
        if row.len() > self.columns.len() {
            return Err(ParseError::Malformed {
                line,
                reason: format!(
                    "expected {} fields, found {}",
                    self.columns.len(),
                    row.len()
                ),
            });
        }
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
        Ok(())
    }
}

/// Errors raised by parse functions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing but blank lines
    #[error("input contains no data")]
    Empty,

    /// A line could not be interpreted
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Signature every parser implements
pub type ParseFn = fn(&str) -> Result<ParsedTable, ParseError>;

/// Named parse function
#[derive(Debug, Clone, Copy)]
pub struct ParserEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub parse: ParseFn,
}

/// Parsers shipped with the crate
pub const BUILTIN_PARSERS: &[ParserEntry] = &[
    ParserEntry {
        name: "tourism_guides_directory",
        description: "Tourism guides directory export (tab or multi-space separated)",
        parse: parse_tourism_guides,
    },
    ParserEntry {
        name: "csv",
        description: "Comma-separated values with a header row",
        parse: parse_csv,
    },
    ParserEntry {
        name: "tsv",
        description: "Tab-separated values with a header row",
        parse: parse_tsv,
    },
    ParserEntry {
        name: "semicolon",
        description: "Semicolon-separated values with a header row",
        parse: parse_semicolon,
    },
    ParserEntry {
        name: "jsonl",
        description: "One flat JSON object per line",
        parse: parse_jsonl,
    },
];

/// Lookup table from parser name to entry
#[derive(Debug, Clone)]
pub struct ParserRegistry {
    entries: BTreeMap<&'static str, ParserEntry>,
}

impl ParserRegistry {
    /// Registry holding the built-in parsers
    pub fn builtin() -> Result<Self, ContractError> {
        Self::from_entries(BUILTIN_PARSERS.iter().copied())
    }

    /// Build a registry, rejecting duplicate names
    pub fn from_entries(
        entries: impl IntoIterator<Item = ParserEntry>,
    ) -> Result<Self, ContractError> {
        let mut registry = Self {
            entries: BTreeMap::new(),
        };
        for entry in entries {
            registry = registry.with_entry(entry)?;
        }
        Ok(registry)
    }

    /// Register an additional parser
    pub fn with_entry(mut self, entry: ParserEntry) -> Result<Self, ContractError> {
        if self.entries.contains_key(entry.name) {
            return Err(ContractError::DuplicateParser(entry.name.to_string()));
        }
        self.entries.insert(entry.name, entry);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ParserEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ParserEntry> {
        self.entries.values()
    }

    /// Parser named by a contract
    pub fn resolve(&self, contract: &DatasetContract) -> Result<&ParserEntry, ContractError> {
        self.get(&contract.parser)
            .ok_or_else(|| ContractError::Invalid {
                dataset_id: contract.dataset_id.clone(),
                violations: vec![crate::error::Violation::new(
                    "parser",
                    format!("no parser registered under '{}'", contract.parser),
                )],
            })
    }
}

/// Split into non-blank lines with their 1-based line numbers
pub(crate) fn numbered_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty())
}
