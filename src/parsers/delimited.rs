//! Delimited text with a header row
//!
//! Fields may be wrapped in double quotes; a doubled quote inside a quoted
//! field is a literal quote and quoted fields may span lines.

use super::{ParseError, ParsedTable};

pub fn parse_csv(text: &str) -> Result<ParsedTable, ParseError> {
    parse_delimited(text, ',')
}

pub fn parse_tsv(text: &str) -> Result<ParsedTable, ParseError> {
    parse_delimited(text, '\t')
}

pub fn parse_semicolon(text: &str) -> Result<ParsedTable, ParseError> {
    parse_delimited(text, ';')
}

/// Parse `text` split on `delimiter`; the first record names the columns
pub fn parse_delimited(text: &str, delimiter: char) -> Result<ParsedTable, ParseError> {
    let mut records = Records::new(text, delimiter);

    let (_, header) = records.next().ok_or(ParseError::Empty)??;
    let columns: Vec<String> = header.into_iter().map(|c| c.trim().to_string()).collect();
    if let Some(position) = columns.iter().position(String::is_empty) {
        return Err(ParseError::Malformed {
            line: 1,
            reason: format!("header column {} has no name", position + 1),
        });
    }

    let mut table = ParsedTable::new(columns);
    for record in records {
        let (line, fields) = record?;
        table.push_row(fields.into_iter().map(|f| f.trim().to_string()).collect(), line)?;
    }
    Ok(table)
}

/// Iterator over non-blank records with the line each one starts on
struct Records<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    delimiter: char,
    line: usize,
}

impl<'a> Records<'a> {
    fn new(text: &'a str, delimiter: char) -> Self {
        Self {
            chars: text.chars().peekable(),
            delimiter,
            line: 1,
        }
    }

    fn read_record(&mut self) -> Result<Vec<String>, ParseError> {
        let start_line = self.line;
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut in_quotes = false;

        while let Some(c) = self.chars.next() {
            if in_quotes {
                match c {
                    '"' if self.chars.peek() == Some(&'"') => {
                        self.chars.next();
                        field.push('"');
                    }
                    '"' => in_quotes = false,
                    '\n' => {
                        self.line += 1;
                        field.push('\n');
                    }
                    _ => field.push(c),
                }
                continue;
            }
            match c {
                '"' if field.trim().is_empty() => {
                    field.clear();
                    in_quotes = true;
                }
                '\r' if self.chars.peek() == Some(&'\n') => {}
                '\n' => {
                    self.line += 1;
                    fields.push(field);
                    return Ok(fields);
                }
                c if c == self.delimiter => fields.push(std::mem::take(&mut field)),
                _ => field.push(c),
            }
        }

        if in_quotes {
            return Err(ParseError::Malformed {
                line: start_line,
                reason: "unterminated quoted field".to_string(),
            });
        }
        fields.push(field);
        Ok(fields)
    }
}

impl Iterator for Records<'_> {
    type Item = Result<(usize, Vec<String>), ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.chars.peek().is_some() {
            let line = self.line;
            match self.read_record() {
                Ok(fields) if fields.iter().all(|f| f.trim().is_empty()) => continue,
                Ok(fields) => return Some(Ok((line, fields))),
                Err(e) => {
                    // Nothing left to resynchronise on after an open quote.
                    while self.chars.next().is_some() {}
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
