//! Structural validation of canonical documents.

use crate::models::{is_supported_country, is_supported_currency, CanonicalDocument, DocType};
use serde_json::Value;

const BANK_DIRECTIONS: &[&str] = &["debit", "credit"];

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Object(m)) => !m.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    }
}

fn is_amount_like(path: &str) -> bool {
    path.starts_with("totals.")
        || path.ends_with(".amount")
        || path.ends_with(".price")
}

/// Check required top-level fields, supported codes and the doc_type's mandatory fields.
///
/// Returns `(is_valid, errors)`; every error names the offending field.
pub fn validate_canonical(doc: &CanonicalDocument) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    if !doc.as_value().is_object() {
        errors.push("document: must be a JSON object".to_string());
        return (false, errors);
    }

    let doc_type = match doc.doc_type_name() {
        None => {
            errors.push("doc_type: required field is missing".to_string());
            None
        }
        Some(name) => match DocType::parse(name) {
            Some(dt) => Some(dt),
            None => {
                errors.push(format!("doc_type: unsupported value '{}'", name));
                None
            }
        },
    };

    match doc.country() {
        None => errors.push("country: required field is missing".to_string()),
        Some(c) if !is_supported_country(c) => {
            errors.push(format!("country: unsupported value '{}'", c))
        }
        Some(_) => {}
    }

    match doc.currency() {
        None => errors.push("currency: required field is missing".to_string()),
        Some(c) if !is_supported_currency(c) => {
            errors.push(format!("currency: unsupported value '{}'", c))
        }
        Some(_) => {}
    }

    if let Some(dt) = doc_type {
        for field in dt.required_fields() {
            if !is_present(doc.get(field)) {
                errors.push(format!("{}: required field is missing", field));
                continue;
            }
            if is_amount_like(field) && doc.get_f64(field).is_none() {
                errors.push(format!("{}: must be numeric", field));
            }
        }
        if dt == DocType::BankTx {
            if let Some(direction) = doc.get_str("bank_tx.direction") {
                if !BANK_DIRECTIONS.contains(&direction) {
                    errors.push(format!(
                        "bank_tx.direction: must be one of debit, credit (got '{}')",
                        direction
                    ));
                }
            }
        }
        if let Some(breakdown) = doc.get("totals.tax_breakdown") {
            if !breakdown.is_array() {
                errors.push("totals.tax_breakdown: must be a list".to_string());
            }
        }
    }

    (errors.is_empty(), errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_invoice() -> CanonicalDocument {
        CanonicalDocument::new(json!({
            "doc_type": "invoice",
            "country": "EC",
            "currency": "USD",
            "invoice_number": "001-001-000000123",
            "vendor": {"name": "Distribuidora Andina S.A."},
            "totals": {"subtotal": 100.0, "tax": 15.0, "total": 115.0}
        }))
    }

    #[test]
    fn minimal_invoice_is_valid() {
        let (ok, errors) = validate_canonical(&minimal_invoice());
        assert!(ok);
        assert!(errors.is_empty());
    }

    #[test]
    fn removing_any_required_field_invalidates() {
        for field in [
            "doc_type",
            "country",
            "currency",
            "invoice_number",
            "vendor.name",
            "totals.subtotal",
            "totals.tax",
            "totals.total",
        ] {
            let mut doc = minimal_invoice();
            doc.remove(field);
            let (ok, errors) = validate_canonical(&doc);
            assert!(!ok, "removing {} should invalidate", field);
            assert!(
                errors.iter().any(|e| e.contains(field)),
                "errors for {} should name it: {:?}",
                field,
                errors
            );
        }
    }

    #[test]
    fn unsupported_codes_rejected() {
        let mut doc = minimal_invoice();
        doc.set("country", json!("ZZ"));
        doc.set("currency", json!("XXX"));
        let (ok, errors) = validate_canonical(&doc);
        assert!(!ok);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn bank_tx_direction_checked() {
        let doc = CanonicalDocument::new(json!({
            "doc_type": "bank_tx",
            "country": "ES",
            "currency": "EUR",
            "bank_tx": {"amount": 10.0, "direction": "sideways", "value_date": "2024-01-01"}
        }));
        let (ok, errors) = validate_canonical(&doc);
        assert!(!ok);
        assert!(errors[0].starts_with("bank_tx.direction"));
    }

    #[test]
    fn non_numeric_total_rejected() {
        let mut doc = minimal_invoice();
        doc.set("totals.total", json!("ciento quince"));
        let (ok, errors) = validate_canonical(&doc);
        assert!(!ok);
        assert!(errors.iter().any(|e| e == "totals.total: must be numeric"));
    }

    #[test]
    fn non_finite_amounts_rejected() {
        for price in ["NaN", "inf", "-inf", "infinity"] {
            let doc = CanonicalDocument::new(json!({
                "doc_type": "product",
                "country": "EC",
                "currency": "USD",
                "product": {"name": "Tornillo", "price": price}
            }));
            let (ok, errors) = validate_canonical(&doc);
            assert!(!ok, "price {} should invalidate", price);
            assert!(errors.iter().any(|e| e == "product.price: must be numeric"));
        }

        let doc = CanonicalDocument::new(json!({
            "doc_type": "bank_tx",
            "country": "ES",
            "currency": "EUR",
            "bank_tx": {"amount": "NaN", "direction": "debit", "value_date": "2024-01-01"}
        }));
        let (ok, errors) = validate_canonical(&doc);
        assert!(!ok);
        assert_eq!(errors, vec!["bank_tx.amount: must be numeric".to_string()]);
    }

    #[test]
    fn lowercase_codes_accepted() {
        let mut doc = minimal_invoice();
        doc.set("country", json!("ec"));
        doc.set("currency", json!("usd"));
        let (ok, errors) = validate_canonical(&doc);
        assert!(ok, "{:?}", errors);
    }

    #[test]
    fn validation_does_not_mutate() {
        let doc = minimal_invoice();
        let before = doc.clone();
        let _ = validate_canonical(&doc);
        assert_eq!(doc, before);
    }
}
