//! File sources: turn an uploaded file into headers plus a stream of raw rows.

mod delimited;
mod markup;
mod scanned;
mod spreadsheet;

use crate::error::{PipelineError, Result};
use crate::ocr::OcrExtractor;
use crate::types::{OcrLayout, RawRow};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;

pub use delimited::sniff_delimiter;
pub use spreadsheet::detect_header_row;

/// Files above this size are rejected before parsing.
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Spreadsheet,
    Delimited,
    Xml,
    Scanned,
}

impl SourceKind {
    pub fn for_extension(ext: &str) -> Option<SourceKind> {
        match ext.to_lowercase().as_str() {
            "xlsx" | "xlsm" | "xls" | "ods" => Some(SourceKind::Spreadsheet),
            "csv" | "tsv" | "txt" => Some(SourceKind::Delimited),
            "xml" => Some(SourceKind::Xml),
            "pdf" | "png" | "jpg" | "jpeg" | "tif" | "tiff" => Some(SourceKind::Scanned),
            _ => None,
        }
    }
}

type RowIter = Box<dyn Iterator<Item = Result<RawRow>> + Send>;

/// Headers plus a lazily produced row stream. Iterate it to read rows.
pub struct TabularSource {
    pub kind: SourceKind,
    pub headers: Vec<String>,
    /// How sure the reader is that headers and rows were recovered correctly.
    pub parser_confidence: f64,
    pub ocr_layout: Option<OcrLayout>,
    rows: RowIter,
}

impl TabularSource {
    pub(crate) fn new(
        kind: SourceKind,
        headers: Vec<String>,
        parser_confidence: f64,
        rows: RowIter,
    ) -> Self {
        Self {
            kind,
            headers,
            parser_confidence,
            ocr_layout: None,
            rows,
        }
    }

    /// Consume up to `n` rows (errors included) for sampling.
    pub fn take_sample(&mut self, n: usize) -> Result<Vec<RawRow>> {
        self.rows.by_ref().take(n).collect()
    }
}

impl Iterator for TabularSource {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

impl std::fmt::Debug for TabularSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabularSource")
            .field("kind", &self.kind)
            .field("headers", &self.headers)
            .field("parser_confidence", &self.parser_confidence)
            .field("ocr_layout", &self.ocr_layout)
            .finish_non_exhaustive()
    }
}

pub fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// Open `path` with the reader its extension selects.
pub fn open_source(path: &Path, ocr: Option<&dyn OcrExtractor>) -> Result<TabularSource> {
    let meta = fs::metadata(path)
        .map_err(|e| PipelineError::Extraction(format!("{}: {}", path.display(), e)))?;
    if meta.len() > MAX_FILE_BYTES {
        return Err(PipelineError::Extraction(format!(
            "{}: {} bytes exceeds the {} byte limit",
            path.display(),
            meta.len(),
            MAX_FILE_BYTES
        )));
    }
    let ext = file_extension(path);
    let kind = SourceKind::for_extension(&ext)
        .ok_or_else(|| PipelineError::UnsupportedFormat(format!("'.{}' files", ext)))?;
    tracing::debug!(file = %path.display(), ?kind, "opening source");
    match kind {
        SourceKind::Spreadsheet => spreadsheet::open(path),
        SourceKind::Delimited => delimited::open(path),
        SourceKind::Xml => markup::open(path),
        SourceKind::Scanned => {
            let ocr = ocr.ok_or_else(|| {
                PipelineError::Ocr("OCR is not configured; set AZURE_OCR_KEY and AZURE_OCR_ENDPOINT".to_string())
            })?;
            scanned::open(path, ocr)
        }
    }
}

/// Hex SHA-256 of the file contents.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Trimmed headers with empty ones named `column_<n>` (1-based) and repeats
/// suffixed `_2`, `_3`, ...
pub fn disambiguate_headers<'a, I>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<String> = Vec::new();
    for (i, header) in raw.into_iter().enumerate() {
        let trimmed = header.trim();
        let base = if trimmed.is_empty() {
            format!("column_{}", i + 1)
        } else {
            trimmed.to_string()
        };
        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        let mut name = if *count == 1 {
            base.clone()
        } else {
            format!("{}_{}", base, count)
        };
        while out.contains(&name) {
            *count += 1;
            name = format!("{}_{}", base, count);
        }
        out.push(name);
    }
    out
}

/// Row from cells aligned with `headers`; blank strings become null.
pub(crate) fn row_from_cells<I>(headers: &[String], cells: I) -> RawRow
where
    I: IntoIterator<Item = serde_json::Value>,
{
    let mut cells = cells.into_iter();
    headers
        .iter()
        .map(|h| {
            let value = match cells.next() {
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => serde_json::Value::Null,
                Some(serde_json::Value::String(s)) => serde_json::Value::String(s.trim().to_string()),
                Some(v) => v,
                None => serde_json::Value::Null,
            };
            (h.clone(), value)
        })
        .collect()
}

pub(crate) fn is_blank_row(row: &RawRow) -> bool {
    row.values().all(|v| v.is_null())
}
