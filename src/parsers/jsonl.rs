//! JSON Lines

use serde_json::{Map, Value};

use super::{ParseError, ParsedTable, numbered_lines};

/// One flat JSON object per line. The first object's keys give the column
/// order; keys first seen later are appended.
pub fn parse_jsonl(text: &str) -> Result<ParsedTable, ParseError> {
    let mut objects: Vec<(usize, Map<String, Value>)> = Vec::new();
    let mut columns: Vec<String> = Vec::new();

    for (line, raw) in numbered_lines(text) {
        let value: Value = serde_json::from_str(raw.trim()).map_err(|e| ParseError::Malformed {
            line,
            reason: e.to_string(),
        })?;
        let Value::Object(object) = value else {
            return Err(ParseError::Malformed {
                line,
                reason: "expected a JSON object".to_string(),
            });
        };
        for key in object.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
        objects.push((line, object));
    }

    if objects.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut table = ParsedTable::new(columns);
    for (line, object) in objects {
        let mut row = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            row.push(cell(object.get(column), line, column)?);
        }
        table.push_row(row, line)?;
    }
    Ok(table)
}

fn cell(value: Option<&Value>, line: usize, column: &str) -> Result<String, ParseError> {
    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ParseError::Malformed {
            line,
            reason: format!("field '{}' is not a scalar", column),
        }),
    }
}
