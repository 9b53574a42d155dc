//! Spreadsheet reader (xlsx/xlsm/xls/ods) over calamine.

use super::{disambiguate_headers, is_blank_row, row_from_cells, SourceKind, TabularSource};
use crate::error::{PipelineError, Result};
use crate::services::normalize::{excel_serial_to_date, normalize_header};
use crate::types::RawRow;
use calamine::{open_workbook_auto, Data, Range, Reader};
use serde_json::Value;
use std::path::Path;

const HEADER_SCAN_ROWS: usize = 20;
const HEADER_SCAN_COLS: usize = 50;
const MIN_HEADER_HITS: usize = 3;
/// Iteration stops after this many consecutive empty rows.
const MAX_EMPTY_RUN: usize = 100;

const HEADER_KEYWORDS: &[&str] = &[
    "fecha", "date", "numero", "number", "factura", "invoice", "proveedor", "vendor", "cliente",
    "customer", "total", "subtotal", "importe", "amount", "monto", "valor", "descripcion",
    "description", "concepto", "iva", "tax", "ruc", "nif", "saldo", "balance", "precio", "price",
    "nombre", "name", "codigo", "code", "sku", "stock", "cantidad", "quantity", "categoria",
];

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        _ => String::new(),
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::String(s) => Value::String(s.clone()),
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
            .map(Value::String)
            .unwrap_or(Value::Null),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(_) | Data::Empty => Value::Null,
    }
}

fn keyword_hits(range: &Range<Data>, row: usize) -> usize {
    (0..range.width().min(HEADER_SCAN_COLS))
        .filter_map(|col| range.get((row, col)))
        .map(|cell| normalize_header(&cell_text(cell)))
        .filter(|text| !text.is_empty() && HEADER_KEYWORDS.iter().any(|k| text.contains(k)))
        .count()
}

fn row_is_empty(range: &Range<Data>, row: usize) -> bool {
    (0..range.width()).all(|col| {
        range
            .get((row, col))
            .map(|c| cell_text(c).is_empty())
            .unwrap_or(true)
    })
}

/// Header row (0-based, relative to the used range): the first of the first
/// 20 rows with at least 3 keyword hits, else the first non-empty row.
/// Returns `(row, matched_by_keywords)`.
pub fn detect_header_row(range: &Range<Data>) -> Option<(usize, bool)> {
    let scan = range.height().min(HEADER_SCAN_ROWS);
    if let Some(row) = (0..scan).find(|&r| keyword_hits(range, r) >= MIN_HEADER_HITS) {
        return Some((row, true));
    }
    (0..range.height())
        .find(|&r| !row_is_empty(range, r))
        .map(|r| (r, false))
}

struct SheetRows {
    range: Range<Data>,
    headers: Vec<String>,
    next: usize,
    empty_run: usize,
}

impl Iterator for SheetRows {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.range.height() {
            let row_idx = self.next;
            self.next += 1;
            let cells = (0..self.headers.len()).map(|col| {
                self.range
                    .get((row_idx, col))
                    .map(cell_value)
                    .unwrap_or(Value::Null)
            });
            let row = row_from_cells(&self.headers, cells);
            if is_blank_row(&row) {
                self.empty_run += 1;
                if self.empty_run >= MAX_EMPTY_RUN {
                    self.next = self.range.height();
                    return None;
                }
                continue;
            }
            self.empty_run = 0;
            return Some(Ok(row));
        }
        None
    }
}

pub(super) fn open(path: &Path) -> Result<TabularSource> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::Extraction("workbook has no sheets".to_string()))?;
    let range = workbook.worksheet_range(&sheet)?;

    let Some((header_row, by_keywords)) = detect_header_row(&range) else {
        return Ok(TabularSource::new(
            SourceKind::Spreadsheet,
            Vec::new(),
            0.0,
            Box::new(std::iter::empty()),
        ));
    };

    let mut raw_headers: Vec<String> = (0..range.width())
        .map(|col| range.get((header_row, col)).map(cell_text).unwrap_or_default())
        .collect();
    while raw_headers.last().map(|h| h.is_empty()).unwrap_or(false) {
        raw_headers.pop();
    }
    let headers = disambiguate_headers(raw_headers.iter().map(String::as_str));
    tracing::debug!(
        sheet = %sheet,
        header_row,
        by_keywords,
        columns = headers.len(),
        "spreadsheet header detected"
    );

    let rows = SheetRows {
        range,
        headers: headers.clone(),
        next: header_row + 1,
        empty_run: 0,
    };
    let confidence = if by_keywords { 0.95 } else { 0.8 };
    Ok(TabularSource::new(
        SourceKind::Spreadsheet,
        headers,
        confidence,
        Box::new(rows),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::open_source;
    use rust_xlsxwriter::Workbook;
    use serde_json::json;

    #[test]
    fn header_row_found_below_title_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ventas.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Reporte de productos").unwrap();
        sheet.write_string(1, 0, "Generado 2024").unwrap();
        for (col, h) in ["Código", "Nombre", "Precio", "Stock", ""].iter().enumerate() {
            if !h.is_empty() {
                sheet.write_string(3, col as u16, *h).unwrap();
            }
        }
        sheet.write_string(4, 0, "A-1").unwrap();
        sheet.write_string(4, 1, "Tornillo").unwrap();
        sheet.write_number(4, 2, 0.25).unwrap();
        sheet.write_number(4, 3, 100).unwrap();
        // row 5 left empty
        sheet.write_string(6, 0, "A-2").unwrap();
        sheet.write_string(6, 1, "Tuerca").unwrap();
        sheet.write_number(6, 2, 0.1).unwrap();
        workbook.save(&path).unwrap();

        let source = open_source(&path, None).unwrap();
        assert_eq!(source.headers, vec!["Código", "Nombre", "Precio", "Stock"]);
        assert!((source.parser_confidence - 0.95).abs() < 1e-9);
        let rows: Vec<_> = source.map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Nombre"], json!("Tornillo"));
        assert_eq!(rows[0]["Precio"], json!(0.25));
        assert_eq!(rows[1]["Stock"], json!(null));
    }
}
