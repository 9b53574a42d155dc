//! Delimited text reader (csv/tsv/txt).

use super::{disambiguate_headers, is_blank_row, row_from_cells, SourceKind, TabularSource};
use crate::error::Result;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const CANDIDATES: &[u8] = b",;\t|";

/// Most frequent candidate delimiter on the first line; `,` when none occurs.
/// Ties go to the earlier candidate.
pub fn sniff_delimiter(first_line: &str) -> u8 {
    let mut best = (b',', 0usize);
    for &candidate in CANDIDATES {
        let count = first_line.bytes().filter(|b| *b == candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

pub(super) fn open(path: &Path) -> Result<TabularSource> {
    let mut first_line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first_line)?;
    let delimiter = sniff_delimiter(first_line.trim_start_matches('\u{feff}'));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_path(path)?;
    let headers = disambiguate_headers(reader.headers()?.iter());
    tracing::debug!(
        delimiter = %(delimiter as char).escape_default(),
        columns = headers.len(),
        "delimited header read"
    );

    let row_headers = headers.clone();
    let rows = reader
        .into_records()
        .map(move |record| -> Result<_> {
            let record = record?;
            Ok(row_from_cells(
                &row_headers,
                record.iter().map(|c| serde_json::Value::String(c.to_string())),
            ))
        })
        .filter(|row| !matches!(row, Ok(r) if is_blank_row(r)));

    Ok(TabularSource::new(
        SourceKind::Delimited,
        headers,
        0.9,
        Box::new(rows),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::open_source;
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn delimiter_sniffing() {
        assert_eq!(sniff_delimiter("a;b;c"), b';');
        assert_eq!(sniff_delimiter("a\tb\tc"), b'\t');
        assert_eq!(sniff_delimiter("a|b"), b'|');
        assert_eq!(sniff_delimiter("single"), b',');
        assert_eq!(sniff_delimiter("a,b;c"), b',');
    }

    #[test]
    fn semicolon_file_with_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banco.csv");
        fs::write(
            &path,
            "Fecha;Concepto;Importe;Importe\n01/02/2024;Nomina;1.500,00\n;;;\n02/02/2024;Luz;-45,10;x;extra\n",
        )
        .unwrap();
        let source = open_source(&path, None).unwrap();
        assert_eq!(source.headers, vec!["Fecha", "Concepto", "Importe", "Importe_2"]);
        let rows: Vec<_> = source.map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Importe"], json!("1.500,00"));
        assert_eq!(rows[0]["Importe_2"], json!(null));
        assert_eq!(rows[1]["Importe_2"], json!("x"));
        assert_eq!(rows[1].len(), 4);
    }
}
