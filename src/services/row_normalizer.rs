//! Applies a mapping suggestion to raw rows and assembles canonical documents.

use super::normalize::{excel_serial_to_date, normalize_header, parse_date, parse_number};
use crate::models::{CanonicalDocument, DocType, MappingSuggestion, Transform};
use crate::types::RawRow;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Apply one transform; values that fail to convert are kept unchanged.
pub fn apply_transform(transform: Transform, value: &Value) -> Value {
    match (transform, value) {
        (Transform::ParseNumber, Value::String(s)) => parse_number(s)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        (Transform::ParseDate, Value::String(s)) => parse_date(s)
            .map(Value::String)
            .unwrap_or_else(|| value.clone()),
        (Transform::ParseDate, Value::Number(n)) => n
            .as_f64()
            .and_then(excel_serial_to_date)
            .map(Value::String)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Project a raw row onto canonical fields: `canonical_field → value`.
///
/// Blank cells are skipped so defaults can fill them. When two headers feed the
/// same field the first non-blank one wins.
pub fn normalize_row(raw: &RawRow, suggestion: &MappingSuggestion) -> Map<String, Value> {
    let mut out = Map::new();
    for (header, value) in raw {
        let Some(field) = suggestion.mappings.get(header) else {
            continue;
        };
        if is_blank(value) || out.contains_key(field) {
            continue;
        }
        let converted = match suggestion.transforms.get(header) {
            Some(t) => apply_transform(*t, value),
            None => match value {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other.clone(),
            },
        };
        out.insert(field.clone(), converted);
    }
    for (field, default) in &suggestion.defaults {
        if !out.contains_key(field) {
            out.insert(field.clone(), default.clone());
        }
    }
    out
}

/// Map localized debit/credit words onto `debit` / `credit`.
fn normalize_direction(raw: &str) -> Option<&'static str> {
    match normalize_header(raw).as_str() {
        "debit" | "debito" | "cargo" | "d" | "dr" | "egreso" | "retiro" | "out" => Some("debit"),
        "credit" | "credito" | "abono" | "c" | "cr" | "ingreso" | "deposito" | "in" => {
            Some("credit")
        }
        _ => None,
    }
}

/// Nest a normalized map into a canonical document.
///
/// Fields named `doc_type`, `country` or `currency` in the row override the
/// caller's values.
pub fn build_canonical(
    doc_type: DocType,
    country: &str,
    currency: &str,
    normalized: &Map<String, Value>,
) -> CanonicalDocument {
    let mut doc = CanonicalDocument::with_header(doc_type, country, currency);
    for (field, value) in normalized {
        match field.as_str() {
            "country" | "currency" => {
                if let Some(s) = value.as_str() {
                    doc.set(field, Value::String(s.trim().to_uppercase()));
                }
            }
            "doc_type" => {}
            _ => doc.set(field, value.clone()),
        }
    }
    if doc_type == DocType::BankTx {
        finish_bank_tx(&mut doc);
    }
    doc
}

fn finish_bank_tx(doc: &mut CanonicalDocument) {
    let explicit = doc
        .get_str("bank_tx.direction")
        .map(|d| normalize_direction(d).map(str::to_string).unwrap_or_else(|| d.to_string()));
    let amount = doc.get_f64("bank_tx.amount");
    let direction = match (explicit, amount) {
        (Some(d), _) => Some(d),
        (None, Some(a)) if a < 0.0 => Some("debit".to_string()),
        (None, Some(_)) => Some("credit".to_string()),
        (None, None) => None,
    };
    if let Some(d) = direction {
        doc.set("bank_tx.direction", Value::String(d));
    }
    if let Some(a) = amount {
        if let Some(n) = serde_json::Number::from_f64(a.abs()) {
            doc.set("bank_tx.amount", Value::Number(n));
        }
    }
}

/// Content hash of a normalized record; key order does not matter.
pub fn dedupe_hash(normalized: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = normalized.iter().collect();
    let body = serde_json::to_string(&sorted).unwrap_or_default();
    format!("{:x}", Sha256::digest(body.as_bytes()))
}

/// Deterministic key for `(tenant, file content, row index)`.
pub fn idempotency_key(tenant_id: &str, file_digest: &str, idx: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(file_digest.as_bytes());
    hasher.update(b"|");
    hasher.update(idx.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MappingProvider;
    use serde_json::json;

    fn suggestion(doc_type: DocType, pairs: &[(&str, &str)]) -> MappingSuggestion {
        let mut s = MappingSuggestion::empty(doc_type, MappingProvider::Heuristics);
        for (h, f) in pairs {
            s.mappings.insert(h.to_string(), f.to_string());
        }
        s.derive_transforms();
        s
    }

    fn row(pairs: &[(&str, Value)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn normalizes_and_transforms() {
        let s = suggestion(
            DocType::Invoice,
            &[("Nro", "invoice_number"), ("Total", "totals.total"), ("Fecha", "issue_date")],
        );
        let raw = row(&[
            ("Nro", json!(" 001-001-000000123 ")),
            ("Total", json!("1.120,50")),
            ("Fecha", json!("05/02/2024")),
            ("Ignored", json!("x")),
        ]);
        let n = normalize_row(&raw, &s);
        assert_eq!(n["invoice_number"], json!("001-001-000000123"));
        assert_eq!(n["totals.total"], json!(1120.5));
        assert_eq!(n["issue_date"], json!("2024-02-05"));
        assert!(!n.contains_key("Ignored"));
    }

    #[test]
    fn defaults_fill_blank_cells() {
        let mut s = suggestion(DocType::Product, &[("Nombre", "product.name"), ("Unidad", "product.unit")]);
        s.defaults.insert("product.unit".into(), json!("unit"));
        let n = normalize_row(&row(&[("Nombre", json!("Tornillo")), ("Unidad", json!(""))]), &s);
        assert_eq!(n["product.unit"], json!("unit"));
    }

    #[test]
    fn bank_direction_inferred_from_sign() {
        let s = suggestion(
            DocType::BankTx,
            &[("Importe", "bank_tx.amount"), ("Fecha valor", "bank_tx.value_date")],
        );
        let n = normalize_row(&row(&[("Importe", json!("-25,00")), ("Fecha valor", json!("2024-01-02"))]), &s);
        let doc = build_canonical(DocType::BankTx, "ES", "EUR", &n);
        assert_eq!(doc.get_str("bank_tx.direction"), Some("debit"));
        assert_eq!(doc.get_f64("bank_tx.amount"), Some(25.0));
    }

    #[test]
    fn localized_direction_words() {
        let mut n = Map::new();
        n.insert("bank_tx.amount".into(), json!(10.0));
        n.insert("bank_tx.direction".into(), json!("Abono"));
        let doc = build_canonical(DocType::BankTx, "ES", "EUR", &n);
        assert_eq!(doc.get_str("bank_tx.direction"), Some("credit"));
    }

    #[test]
    fn dedupe_hash_ignores_key_order() {
        let mut a = Map::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = Map::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));
        assert_eq!(dedupe_hash(&a), dedupe_hash(&b));
        assert_eq!(dedupe_hash(&a).len(), 64);
    }

    #[test]
    fn idempotency_key_is_stable() {
        assert_eq!(idempotency_key("t1", "abc", 3), idempotency_key("t1", "abc", 3));
        assert_ne!(idempotency_key("t1", "abc", 3), idempotency_key("t2", "abc", 3));
        assert_ne!(idempotency_key("t1", "abc", 3), idempotency_key("t1", "abc", 4));
    }
}
