//! OCR capability: Azure Document Intelligence layout client plus heuristic
//! extractors that turn recognised text into raw rows.

use crate::config::OcrConfig;
use crate::error::{PipelineError, Result};
use crate::services::normalize::{parse_date, parse_number};
use crate::types::{OcrDocument, OcrLayout, OcrLine, RawRow};
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

const API_VERSION: &str = "2024-11-30";
const MAX_POLLS: u32 = 60;

/// Text extraction from a scanned document or PDF.
pub trait OcrExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<OcrDocument>;
}

/// `prebuilt-layout` model: lines, word confidences and tables.
pub struct AzureLayoutClient {
    client: Client,
    endpoint: String,
    key: String,
    poll_interval: Duration,
}

impl AzureLayoutClient {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PipelineError::Ocr(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            key: config.key.clone(),
            poll_interval: Duration::from_secs(2),
        })
    }

    fn submit(&self, bytes: Vec<u8>) -> Result<String> {
        let url = format!(
            "{}/documentintelligence/documentModels/prebuilt-layout:analyze?api-version={}",
            self.endpoint, API_VERSION
        );
        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .map_err(|e| {
                PipelineError::Ocr(if e.is_connect() || e.is_timeout() {
                    "OCR service unreachable".to_string()
                } else {
                    e.to_string()
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(PipelineError::Ocr(format!(
                "OCR request failed ({}): {}",
                status,
                if body.is_empty() {
                    "invalid key or endpoint?"
                } else {
                    body.as_str()
                }
            )));
        }

        response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Ocr("No Operation-Location in response".to_string()))
    }

    fn poll(&self, result_url: &str) -> Result<Value> {
        for _ in 0..MAX_POLLS {
            std::thread::sleep(self.poll_interval);
            let payload: Value = self
                .client
                .get(result_url)
                .header("Ocp-Apim-Subscription-Key", &self.key)
                .send()
                .map_err(|e| PipelineError::Ocr(e.to_string()))?
                .json()
                .map_err(|e| PipelineError::Ocr(format!("Invalid JSON: {}", e)))?;
            match payload.get("status").and_then(|s| s.as_str()).unwrap_or("") {
                "succeeded" => {
                    return payload
                        .get("analyzeResult")
                        .cloned()
                        .ok_or_else(|| PipelineError::Ocr("No analyzeResult".to_string()))
                }
                "failed" => {
                    let message = payload
                        .pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error");
                    return Err(PipelineError::Ocr(format!("Analysis failed: {}", message)));
                }
                _ => {}
            }
        }
        Err(PipelineError::Ocr("Analysis timed out".to_string()))
    }
}

impl OcrExtractor for AzureLayoutClient {
    fn extract(&self, path: &Path) -> Result<OcrDocument> {
        let bytes = fs::read(path)?;
        tracing::info!(file = %path.display(), bytes = bytes.len(), "submitting document to OCR");
        let result_url = self.submit(bytes)?;
        let analyze_result = self.poll(&result_url)?;
        Ok(document_from_layout(&analyze_result))
    }
}

/// Build an [`OcrDocument`] from a layout `analyzeResult`.
pub fn document_from_layout(result: &Value) -> OcrDocument {
    let pages = result
        .get("pages")
        .and_then(|p| p.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut lines = Vec::new();
    let mut word_confidences = Vec::new();
    for page in pages {
        for line in page.get("lines").and_then(|l| l.as_array()).into_iter().flatten() {
            let text = line
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            let confidence = line.get("confidence").and_then(|c| c.as_f64());
            lines.push(OcrLine { text, confidence });
        }
        for word in page.get("words").and_then(|w| w.as_array()).into_iter().flatten() {
            if let Some(c) = word.get("confidence").and_then(|c| c.as_f64()) {
                word_confidences.push(c);
            }
        }
    }
    if word_confidences.is_empty() {
        word_confidences.extend(lines.iter().filter_map(|l| l.confidence));
    }
    let confidence = if word_confidences.is_empty() {
        0.0
    } else {
        (word_confidences.iter().sum::<f64>() / word_confidences.len() as f64).clamp(0.0, 1.0)
    };

    let text = result
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| {
            lines
                .iter()
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        });

    let tables = result
        .get("tables")
        .and_then(|t| t.as_array())
        .map(|tables| tables.iter().map(table_cells).collect())
        .unwrap_or_default();

    OcrDocument {
        layout: detect_layout(&text),
        text,
        lines,
        confidence,
        tables,
        pages: pages.len() as u32,
    }
}

/// Grid bounds; a table's declared size is never trusted past these.
const MAX_TABLE_ROWS: usize = 5_000;
const MAX_TABLE_COLS: usize = 100;

fn table_cells(table: &Value) -> Vec<Vec<String>> {
    let declared = |key: &str, cap: usize| {
        table
            .get(key)
            .and_then(|n| n.as_u64())
            .map_or(0, |n| n.min(cap as u64) as usize)
    };
    let rows = declared("rowCount", MAX_TABLE_ROWS);
    let cols = declared("columnCount", MAX_TABLE_COLS);

    let cells: Vec<(usize, usize, &str)> = table
        .get("cells")
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
        .filter_map(|cell| {
            let r = cell.get("rowIndex").and_then(|n| n.as_u64()).unwrap_or(0);
            let c = cell.get("columnIndex").and_then(|n| n.as_u64()).unwrap_or(0);
            let content = cell.get("content").and_then(|v| v.as_str()).unwrap_or("");
            (r < rows as u64 && c < cols as u64).then_some((r as usize, c as usize, content))
        })
        .collect();
    let Some(used_rows) = cells.iter().map(|(r, _, _)| r + 1).max() else {
        return Vec::new();
    };
    let used_cols = cells.iter().map(|(_, c, _)| c + 1).max().unwrap_or(0);

    let mut grid = vec![vec![String::new(); used_cols]; used_rows];
    for (r, c, content) in cells {
        grid[r][c] = content.trim().to_string();
    }
    grid
}

// ---- layout detection ----

const INVOICE_MARKERS: &[&str] = &[
    "factura", "invoice", "subtotal", "autorizacion", "razon social", "clave de acceso",
    "iva", "vat", "folio fiscal",
];
const RECEIPT_MARKERS: &[&str] = &[
    "ticket", "recibo", "receipt", "cambio", "efectivo", "gracias por su compra", "cajero",
    "caja", "thank you",
];
const BANK_MARKERS: &[&str] = &[
    "estado de cuenta", "extracto", "statement", "saldo", "balance", "deposito", "retiro",
    "movimientos", "cuenta corriente", "cuenta de ahorros",
];

fn fold(text: &str) -> String {
    crate::services::normalize::normalize_header(text).replace('_', " ")
}

/// Guess the layout from recognised text. Ties and empty evidence give `Unknown`.
pub fn detect_layout(text: &str) -> OcrLayout {
    let folded = fold(text);
    let score = |markers: &[&str]| markers.iter().filter(|m| folded.contains(*m)).count();
    let candidates = [
        (OcrLayout::Invoice, score(INVOICE_MARKERS)),
        (OcrLayout::Receipt, score(RECEIPT_MARKERS)),
        (OcrLayout::BankStatement, score(BANK_MARKERS)),
    ];
    let best = candidates.iter().map(|(_, s)| *s).max().unwrap_or(0);
    if best == 0 {
        return OcrLayout::Unknown;
    }
    let mut winners = candidates.iter().filter(|(_, s)| *s == best);
    match (winners.next(), winners.next()) {
        (Some((layout, _)), None) => *layout,
        _ => OcrLayout::Unknown,
    }
}

// ---- company-name helpers ----

/// True if the string looks like an address suffix (", 170150 Quito", "; EC").
fn looks_like_address_suffix(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() {
        return true;
    }
    if s.len() <= 3 && s.chars().all(|c| c.is_ascii_alphabetic()) {
        return true;
    }
    s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}

/// True if a full line looks like an address (street or number first).
fn looks_like_address_line(line: &str) -> bool {
    let s = line.trim();
    if s.is_empty() {
        return false;
    }
    if s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        return true;
    }
    let lower = fold(s);
    const ADDRESS: &[&str] = &[
        "av", "avenida", "calle", "c/", "direccion", "dir", "street", "avenue", "road", "carrera",
        "paseo", "plaza",
    ];
    ADDRESS
        .iter()
        .any(|kw| lower.starts_with(&format!("{} ", kw)) || lower.contains(&format!(" {} ", kw)))
}

/// Strip a trailing "; address" or ", address" from a company name.
fn company_name_only(raw: &str) -> String {
    let s = raw.trim();
    for sep in ["; ", ", "] {
        if let Some(pos) = s.find(sep) {
            if looks_like_address_suffix(&s[pos + sep.len()..]) {
                return s[..pos].trim().to_string();
            }
        }
    }
    s.to_string()
}

fn is_legal_form_token(token: &str) -> bool {
    let t = token
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == ',')
        .to_lowercase();
    matches!(
        t.as_str(),
        "s.a" | "sa" | "s.a.s" | "sas" | "s.l" | "sl" | "s.r.l" | "srl" | "cia" | "cía" | "ltda"
            | "c.a" | "inc" | "llc" | "ltd" | "gmbh" | "s.a.c" | "sac" | "s.c"
    )
}

fn company_has_legal_form(name: &str) -> bool {
    name.split_whitespace().any(is_legal_form_token)
}

/// Best line carrying a legal form; earlier and longer lines win.
fn find_company_line(lines: &[&str]) -> Option<String> {
    let mut best: Option<(String, f64)> = None;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || !company_has_legal_form(trimmed) {
            continue;
        }
        // Mostly digits: a tax id or account number.
        let digits = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
        if digits as f32 > trimmed.len() as f32 * 0.4 {
            continue;
        }
        let mut score = 1.0 - idx as f64 * 0.01;
        if trimmed.chars().filter(|c| !c.is_whitespace()).count() > 10 {
            score += 0.1;
        }
        if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
            best = Some((trimmed.to_string(), score));
        }
    }
    best.map(|(line, _)| company_name_only(&line))
}

/// First plausible name line: no digits-only content, no marker keyword, not an address.
fn first_name_line(lines: &[&str]) -> Option<String> {
    lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| l.chars().filter(|c| c.is_alphabetic()).count() >= 3)
        .filter(|l| !looks_like_address_line(l))
        .find(|l| {
            let folded = fold(l);
            !INVOICE_MARKERS
                .iter()
                .chain(RECEIPT_MARKERS)
                .chain(BANK_MARKERS)
                .any(|m| folded.contains(m))
        })
        .map(|l| company_name_only(&l.split_whitespace().collect::<Vec<_>>().join(" ")))
}

fn vendor_name(lines: &[&str]) -> Option<String> {
    find_company_line(lines).or_else(|| first_name_line(lines))
}

// ---- field extraction ----

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{4}-\d{2}-\d{2}|\d{1,2}[/\-.]\d{1,2}[/\-.]\d{4})\b").expect("valid date regex")
    })
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\(?\$?\s?\d[\d.,]*\d\)?-?|-?\d").expect("valid amount regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:factura|invoice|folio|comprobante|ticket|recibo|receipt)\s*(?:n[°ºo.]*|no\.?|#|numero|número)?\s*:?\s*([A-Z0-9][A-Z0-9\-/]{2,39})",
        )
        .expect("valid document number regex")
    })
}

fn tax_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:ruc|nif|cif|rfc|nit|tax id|vat)\b\s*[:#]?\s*([A-Z0-9&Ñ]{8,13})")
            .expect("valid tax id regex")
    })
}

fn first_date(text: &str) -> Option<String> {
    date_re()
        .find_iter(text)
        .find_map(|m| parse_date(m.as_str()))
}

fn document_number(text: &str) -> Option<String> {
    number_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .find(|s| s.chars().any(|c| c.is_ascii_digit()))
}

fn tax_id(text: &str) -> Option<String> {
    tax_id_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}

fn last_amount(line: &str) -> Option<f64> {
    amount_re()
        .find_iter(line)
        .filter_map(|m| parse_number(m.as_str()))
        .last()
}

/// Amount on the first line whose folded text starts with one of `labels`
/// and contains none of `exclude`.
fn labelled_amount(lines: &[&str], labels: &[&str], exclude: &[&str]) -> Option<f64> {
    lines.iter().find_map(|line| {
        let folded = fold(line);
        let matches = labels.iter().any(|l| folded.starts_with(l))
            && !exclude.iter().any(|x| folded.contains(x));
        if matches {
            last_amount(line)
        } else {
            None
        }
    })
}

fn put(row: &mut RawRow, header: &str, value: Option<Value>) {
    row.insert(header.to_string(), value.unwrap_or(Value::Null));
}

fn num(v: Option<f64>) -> Option<Value> {
    v.and_then(serde_json::Number::from_f64).map(Value::Number)
}

/// One row for an invoice-like scan.
pub fn extract_invoice(doc: &OcrDocument) -> RawRow {
    let lines: Vec<&str> = doc.text.lines().collect();
    let mut row = RawRow::new();
    put(&mut row, "Numero Factura", document_number(&doc.text).map(Value::String));
    put(&mut row, "Fecha Emision", first_date(&doc.text).map(Value::String));
    put(&mut row, "Proveedor", vendor_name(&lines).map(Value::String));
    put(&mut row, "RUC", tax_id(&doc.text).map(Value::String));
    put(
        &mut row,
        "Subtotal",
        num(labelled_amount(&lines, &["subtotal", "sub total", "base imponible"], &[])),
    );
    put(
        &mut row,
        "IVA",
        num(labelled_amount(&lines, &["iva", "vat", "impuesto", "tax"], &["tarifa"])),
    );
    put(
        &mut row,
        "Total",
        num(labelled_amount(&lines, &["total", "importe total", "valor total"], &["sub", "iva", "impuesto"])),
    );
    row
}

/// One row for a till receipt.
pub fn extract_receipt(doc: &OcrDocument) -> RawRow {
    let lines: Vec<&str> = doc.text.lines().collect();
    let mut row = RawRow::new();
    put(&mut row, "Numero Ticket", document_number(&doc.text).map(Value::String));
    put(&mut row, "Fecha", first_date(&doc.text).map(Value::String));
    put(&mut row, "Establecimiento", vendor_name(&lines).map(Value::String));
    put(&mut row, "RUC", tax_id(&doc.text).map(Value::String));
    put(
        &mut row,
        "IVA",
        num(labelled_amount(&lines, &["iva", "vat", "impuesto", "tax"], &[])),
    );
    put(
        &mut row,
        "Total",
        num(labelled_amount(&lines, &["total", "importe", "a pagar"], &["sub", "iva"])),
    );
    row
}

fn statement_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(\d{4}-\d{2}-\d{2}|\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4})\s+(.+?)\s+(-?\(?[\d.,]*\d\)?-?)(?:\s+(-?[\d.,]*\d))?\s*$",
        )
        .expect("valid statement line regex")
    })
}

/// One row per statement movement: detected tables first, then dated text lines.
pub fn extract_bank_statement(doc: &OcrDocument) -> Vec<RawRow> {
    for table in &doc.tables {
        let Some((header, body)) = table.split_first() else {
            continue;
        };
        if body.is_empty() || header.iter().all(|h| h.is_empty()) {
            continue;
        }
        let headers = crate::sources::disambiguate_headers(header.iter().map(String::as_str));
        return body
            .iter()
            .filter(|r| r.iter().any(|c| !c.is_empty()))
            .map(|r| {
                headers
                    .iter()
                    .enumerate()
                    .map(|(i, h)| {
                        let cell = r.get(i).cloned().unwrap_or_default();
                        (h.clone(), Value::String(cell))
                    })
                    .collect()
            })
            .collect();
    }

    doc.text
        .lines()
        .filter_map(|line| statement_line_re().captures(line))
        .map(|c| {
            let mut row = RawRow::new();
            put(&mut row, "Fecha", c.get(1).map(|m| Value::String(m.as_str().to_string())));
            put(
                &mut row,
                "Descripcion",
                c.get(2).map(|m| Value::String(m.as_str().trim().to_string())),
            );
            put(&mut row, "Importe", num(c.get(3).and_then(|m| parse_number(m.as_str()))));
            put(&mut row, "Saldo", num(c.get(4).and_then(|m| parse_number(m.as_str()))));
            row
        })
        .collect()
}

/// Rows for a recognised document, chosen by its layout hint.
pub fn rows_for_layout(doc: &OcrDocument) -> Vec<RawRow> {
    match doc.layout {
        OcrLayout::Invoice | OcrLayout::Unknown => vec![extract_invoice(doc)],
        OcrLayout::Receipt => vec![extract_receipt(doc)],
        OcrLayout::BankStatement => extract_bank_statement(doc),
    }
}
