//! Tourism guides directory export
//!
//! The export is a loosely tabular text dump. The first line is a header and
//! is ignored. Fields are separated by tabs, or by runs of two or more spaces
//! when the tab split yields too few fields. Lines with fewer than four
//! fields are page furniture and are skipped. Four-field lines carry the
//! guide's full name in the first field.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ParseError, ParsedTable, numbered_lines};
use crate::decode::clean_bom;

/// Observed column names, in output order
pub const TOURISM_GUIDES_COLUMNS: [&str; 5] =
    ["nom", "prenom", "ville", "categorie", "langue_de_travail"];

static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

/// Parse the tourism guides directory export
pub fn parse_tourism_guides(text: &str) -> Result<ParsedTable, ParseError> {
    let mut table = ParsedTable::new(TOURISM_GUIDES_COLUMNS.iter().map(|c| c.to_string()).collect());

    let mut lines = numbered_lines(text);
    if lines.next().is_none() {
        return Err(ParseError::Empty);
    }

    for (line_no, line) in lines {
        if let Some(row) = split_row(&clean_bom(line)) {
            table.push_row(row, line_no)?;
        }
    }
    Ok(table)
}

fn split_row(line: &str) -> Option<Vec<String>> {
    let mut tab_fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    while tab_fields.last().is_some_and(|f| f.is_empty()) {
        tab_fields.pop();
    }
    let non_empty: Vec<&str> = tab_fields.iter().copied().filter(|f| !f.is_empty()).collect();

    // Five or more tab positions: keep them positional so an empty cell stays
    // in its own column instead of shifting the rest left.
    if tab_fields.len() >= 5 && non_empty.len() >= 4 {
        return Some(tab_fields[..5].iter().map(|f| f.to_string()).collect());
    }

    let parts = if non_empty.len() >= 4 {
        non_empty
    } else {
        MULTI_SPACE
            .split(line)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    };

    match parts.len() {
        0..=3 => None,
        4 => {
            let mut name = parts[0].split_whitespace();
            let nom = name.next().unwrap_or_default().to_string();
            let prenom = name.collect::<Vec<_>>().join(" ");
            Some(vec![
                nom,
                prenom,
                parts[1].to_string(),
                parts[2].to_string(),
                parts[3].to_string(),
            ])
        }
        _ => Some(parts[..5].iter().map(|p| p.to_string()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_tab_separated_rows() {
        let text = "Nom\tPrénom\tVille\tCatégorie\tLangue\n\
                    DUPONT\tJean\tParis\tGuide conférencier\tAnglais, Espagnol\n";
        let table = parse_tourism_guides(text).unwrap();
        assert_eq!(table.columns, row(&TOURISM_GUIDES_COLUMNS));
        assert_eq!(
            table.rows,
            vec![row(&["DUPONT", "Jean", "Paris", "Guide conférencier", "Anglais, Espagnol"])]
        );
    }

    #[test]
    fn test_four_fields_split_full_name() {
        let text = "header\nMARTIN Anne Marie\tLyon\tGuide\tItalien\n";
        let table = parse_tourism_guides(text).unwrap();
        assert_eq!(
            table.rows,
            vec![row(&["MARTIN", "Anne Marie", "Lyon", "Guide", "Italien"])]
        );
    }

    #[test]
    fn test_multi_space_fallback() {
        let text = "header\nBERNARD   Luc    Nice   Accompagnateur   Allemand\n";
        let table = parse_tourism_guides(text).unwrap();
        assert_eq!(
            table.rows,
            vec![row(&["BERNARD", "Luc", "Nice", "Accompagnateur", "Allemand"])]
        );
    }

    #[test]
    fn test_empty_tab_cell_stays_positional() {
        let text = "header\nDUPONT\tJean\t\tGuide\tFrançais\n";
        let table = parse_tourism_guides(text).unwrap();
        assert_eq!(table.rows, vec![row(&["DUPONT", "Jean", "", "Guide", "Français"])]);
    }

    #[test]
    fn test_junk_and_blank_lines_skipped() {
        let text = "header\n\n   \nPage 1 of 3\nLEROY\tPaul\tLille\tGuide\tAnglais\n- - -\n";
        let table = parse_tourism_guides(text).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.rows[0][0], "LEROY");
    }

    #[test]
    fn test_header_only_yields_no_rows() {
        let table = parse_tourism_guides("Nom\tPrénom\tVille\tCatégorie\tLangue\n").unwrap();
        assert!(table.is_empty());
        assert_eq!(parse_tourism_guides("\n  \n"), Err(ParseError::Empty));
    }

    #[test]
    fn test_values_are_trimmed_and_bom_removed() {
        let text = "\u{feff}header\n\u{feff} PETIT \t Zoé \t Caen \t Guide \t Breton \n";
        let table = parse_tourism_guides(text).unwrap();
        assert_eq!(table.rows, vec![row(&["PETIT", "Zoé", "Caen", "Guide", "Breton"])]);
    }
}
