//! Country-specific business rules: tax-id checksums, legal tax rates and
//! document-number formats. Runs after (and independently of) structural validation.

use crate::models::CanonicalDocument;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const TAX_ID_FIELDS: &[&str] = &["vendor.tax_id", "customer.tax_id"];
const DOC_NUMBER_FIELDS: &[&str] = &["invoice_number", "receipt_number"];
const RATE_TOLERANCE: f64 = 0.01;

pub trait CountryValidator: Send + Sync {
    fn country(&self) -> &'static str;

    /// `Err(reason)` when the id fails format or checksum.
    fn check_tax_id(&self, tax_id: &str) -> Result<(), String>;

    /// Legal tax rates in percent.
    fn tax_rates(&self) -> &'static [f64];

    fn check_document_number(&self, number: &str) -> Result<(), String>;

    /// Run every rule against the document; returns human-readable errors.
    fn validate(&self, doc: &CanonicalDocument) -> Vec<String> {
        let mut errors = Vec::new();
        for field in TAX_ID_FIELDS {
            if let Some(id) = doc.get_str(field) {
                if let Err(reason) = self.check_tax_id(id) {
                    errors.push(format!("{}: {}", field, reason));
                }
            }
        }
        for (field, rate) in collect_tax_rates(doc) {
            let allowed = self.tax_rates();
            if !allowed.iter().any(|r| (r - rate).abs() < RATE_TOLERANCE) {
                errors.push(format!(
                    "{}: {}% is not a legal {} tax rate (allowed: {})",
                    field,
                    rate,
                    self.country(),
                    allowed
                        .iter()
                        .map(|r| format!("{}%", r))
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }
        for field in DOC_NUMBER_FIELDS {
            if let Some(number) = doc.get_str(field) {
                if let Err(reason) = self.check_document_number(number) {
                    errors.push(format!("{}: {}", field, reason));
                }
            }
        }
        errors
    }
}

/// Rates may be written as percent (12) or fraction (0.12); returns percent.
fn as_percent(rate: f64) -> f64 {
    if rate > 0.0 && rate < 1.0 {
        rate * 100.0
    } else {
        rate
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

fn collect_tax_rates(doc: &CanonicalDocument) -> Vec<(String, f64)> {
    let mut rates = Vec::new();
    for field in ["totals.tax_rate", "product.tax_rate"] {
        if let Some(rate) = doc.get(field).and_then(value_as_f64) {
            rates.push((field.to_string(), as_percent(rate)));
        }
    }
    if let Some(Value::Array(entries)) = doc.get("totals.tax_breakdown") {
        for (i, entry) in entries.iter().enumerate() {
            if let Some(rate) = entry.get("rate").and_then(value_as_f64) {
                rates.push((format!("totals.tax_breakdown[{}].rate", i), as_percent(rate)));
            }
        }
    }
    rates
}

fn digits_of(s: &str) -> Option<Vec<u32>> {
    s.chars().map(|c| c.to_digit(10)).collect()
}

pub struct EcuadorValidator;

impl EcuadorValidator {
    fn check_cedula(d: &[u32]) -> Result<(), String> {
        let province = d[0] * 10 + d[1];
        if !(1..=24).contains(&province) && province != 30 {
            return Err(format!("invalid province code {:02}", province));
        }
        if d[2] >= 6 {
            return Err("third digit must be below 6 for natural persons".to_string());
        }
        let sum: u32 = d[..9]
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let p = if i % 2 == 0 { x * 2 } else { x };
                if p > 9 {
                    p - 9
                } else {
                    p
                }
            })
            .sum();
        let check = (10 - sum % 10) % 10;
        if check != d[9] {
            return Err("check digit mismatch".to_string());
        }
        Ok(())
    }

    fn check_modulo11(d: &[u32], coefficients: &[u32], check_pos: usize) -> Result<(), String> {
        let sum: u32 = d.iter().zip(coefficients).map(|(x, c)| x * c).sum();
        let check = match 11 - sum % 11 {
            11 => 0,
            10 => return Err("check digit mismatch".to_string()),
            c => c,
        };
        if check != d[check_pos] {
            return Err("check digit mismatch".to_string());
        }
        Ok(())
    }
}

impl CountryValidator for EcuadorValidator {
    fn country(&self) -> &'static str {
        "EC"
    }

    fn check_tax_id(&self, tax_id: &str) -> Result<(), String> {
        let id = tax_id.trim();
        if id == "9999999999999" {
            // consumidor final
            return Ok(());
        }
        let d = digits_of(id).ok_or_else(|| "must contain only digits".to_string())?;
        match d.len() {
            10 => Self::check_cedula(&d),
            13 => match d[2] {
                0..=5 => {
                    if id.ends_with("000") {
                        return Err("RUC establishment suffix cannot be 000".to_string());
                    }
                    Self::check_cedula(&d[..10])
                }
                6 => {
                    if id.ends_with("0000") {
                        return Err("RUC establishment suffix cannot be 0000".to_string());
                    }
                    Self::check_modulo11(&d, &[3, 2, 7, 6, 5, 4, 3, 2], 8)
                }
                9 => {
                    if id.ends_with("000") {
                        return Err("RUC establishment suffix cannot be 000".to_string());
                    }
                    Self::check_modulo11(&d, &[4, 3, 2, 7, 6, 5, 4, 3, 2], 9)
                }
                _ => Err("invalid RUC type digit".to_string()),
            },
            n => Err(format!("must have 10 (cédula) or 13 (RUC) digits, got {}", n)),
        }
    }

    fn tax_rates(&self) -> &'static [f64] {
        &[0.0, 5.0, 12.0, 15.0]
    }

    fn check_document_number(&self, number: &str) -> Result<(), String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"^\d{3}-\d{3}-\d{9}$").expect("EC number regex"));
        if re.is_match(number.trim()) {
            Ok(())
        } else {
            Err("expected establishment-emission point-sequence (001-001-000000123)".to_string())
        }
    }
}

pub struct SpainValidator;

const NIF_LETTERS: &[u8] = b"TRWAGMYFPDXBNJZSQVHLCKE";
const CIF_LETTERS: &[u8] = b"JABCDEFGHI";

impl SpainValidator {
    fn check_nif(number: u32, letter: char) -> Result<(), String> {
        let expected = NIF_LETTERS[(number % 23) as usize] as char;
        if expected == letter {
            Ok(())
        } else {
            Err(format!("check letter should be {}", expected))
        }
    }

    fn check_cif(id: &str) -> Result<(), String> {
        let chars: Vec<char> = id.chars().collect();
        let kind = chars[0];
        let digits =
            digits_of(&id[1..8]).ok_or_else(|| "CIF body must be 7 digits".to_string())?;
        let mut sum = 0;
        for (i, &x) in digits.iter().enumerate() {
            if i % 2 == 1 {
                sum += x;
            } else {
                let p = x * 2;
                sum += p / 10 + p % 10;
            }
        }
        let control = (10 - sum % 10) % 10;
        let control_letter = CIF_LETTERS[control as usize] as char;
        let given = chars[8];
        let ok = match kind {
            'P' | 'Q' | 'R' | 'S' | 'N' | 'W' => given == control_letter,
            'A' | 'B' | 'E' | 'H' => given.to_digit(10) == Some(control),
            _ => given == control_letter || given.to_digit(10) == Some(control),
        };
        if ok {
            Ok(())
        } else {
            Err("CIF control character mismatch".to_string())
        }
    }
}

impl CountryValidator for SpainValidator {
    fn country(&self) -> &'static str {
        "ES"
    }

    fn check_tax_id(&self, tax_id: &str) -> Result<(), String> {
        let mut id: String = tax_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        if id.len() == 11 && id.starts_with("ES") {
            id.drain(..2);
        }
        if id.len() != 9 {
            return Err("must have 9 characters".to_string());
        }
        let first = id.chars().next().unwrap_or_default();
        let last = id.chars().last().unwrap_or_default();
        if first.is_ascii_digit() {
            let number: u32 = id[..8]
                .parse()
                .map_err(|_| "NIF must be 8 digits and a letter".to_string())?;
            return Self::check_nif(number, last);
        }
        if let Some(prefix) = "XYZ".find(first) {
            let number: u32 = format!("{}{}", prefix, &id[1..8])
                .parse()
                .map_err(|_| "NIE must be X/Y/Z, 7 digits and a letter".to_string())?;
            return Self::check_nif(number, last);
        }
        if "ABCDEFGHJNPQRSUVW".contains(first) {
            return Self::check_cif(&id);
        }
        Err("unrecognized NIF/NIE/CIF format".to_string())
    }

    fn tax_rates(&self) -> &'static [f64] {
        &[0.0, 4.0, 5.0, 10.0, 21.0]
    }

    fn check_document_number(&self, number: &str) -> Result<(), String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^[A-Za-z0-9][A-Za-z0-9/\-]{0,29}$").expect("ES number regex")
        });
        if re.is_match(number.trim()) {
            Ok(())
        } else {
            Err("must be up to 30 letters, digits, '-' or '/'".to_string())
        }
    }
}

pub struct MexicoValidator;

impl CountryValidator for MexicoValidator {
    fn country(&self) -> &'static str {
        "MX"
    }

    fn check_tax_id(&self, tax_id: &str) -> Result<(), String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE
            .get_or_init(|| Regex::new(r"^[A-ZÑ&]{3,4}\d{6}[A-Z0-9]{3}$").expect("RFC regex"));
        if re.is_match(&tax_id.trim().to_uppercase()) {
            Ok(())
        } else {
            Err("RFC must be 3-4 letters, a yymmdd date and a 3-character homoclave".to_string())
        }
    }

    fn tax_rates(&self) -> &'static [f64] {
        &[0.0, 8.0, 16.0]
    }

    fn check_document_number(&self, number: &str) -> Result<(), String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-]{1,40}$").expect("MX folio regex"));
        if re.is_match(number.trim()) {
            Ok(())
        } else {
            Err("folio must be up to 40 letters, digits or '-'".to_string())
        }
    }
}

static ECUADOR: EcuadorValidator = EcuadorValidator;
static SPAIN: SpainValidator = SpainValidator;
static MEXICO: MexicoValidator = MexicoValidator;

/// Validator for a country code (case-insensitive). Unknown country ⇒ `None`.
pub fn validator_for_country(code: &str) -> Option<&'static dyn CountryValidator> {
    match code.trim().to_ascii_uppercase().as_str() {
        "EC" => Some(&ECUADOR),
        "ES" => Some(&SPAIN),
        "MX" => Some(&MEXICO),
        _ => None,
    }
}

/// Country pass over a document: `(is_valid, errors)`. No validator ⇒ valid.
pub fn validate_country_rules(doc: &CanonicalDocument) -> (bool, Vec<String>) {
    let errors = doc
        .country()
        .and_then(validator_for_country)
        .map(|v| v.validate(doc))
        .unwrap_or_default();
    (errors.is_empty(), errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn factory_is_case_insensitive() {
        assert_eq!(validator_for_country("ec").map(|v| v.country()), Some("EC"));
        assert_eq!(validator_for_country(" Es ").map(|v| v.country()), Some("ES"));
        assert!(validator_for_country("FR").is_none());
    }

    #[test]
    fn ecuador_ids() {
        let ec = EcuadorValidator;
        assert!(ec.check_tax_id("1710034065").is_ok());
        assert!(ec.check_tax_id("1710034065001").is_ok());
        assert!(ec.check_tax_id("1710034066").is_err());
        assert!(ec.check_tax_id("1790011674001").is_ok());
        assert!(ec.check_tax_id("1760001550001").is_ok());
        assert!(ec.check_tax_id("9999999999999").is_ok());
        assert!(ec.check_tax_id("12345").is_err());
        assert!(ec.check_tax_id("17100340AB").is_err());
    }

    #[test]
    fn spain_ids() {
        let es = SpainValidator;
        assert!(es.check_tax_id("12345678Z").is_ok());
        assert!(es.check_tax_id("12345678A").is_err());
        assert!(es.check_tax_id("X1234567L").is_ok());
        assert!(es.check_tax_id("B12345674").is_ok());
        assert!(es.check_tax_id("ESB12345674").is_ok());
        assert!(es.check_tax_id("B12345675").is_err());
    }

    #[test]
    fn mexico_rfc() {
        let mx = MexicoValidator;
        assert!(mx.check_tax_id("XAXX010101000").is_ok());
        assert!(mx.check_tax_id("ABC010101AB1").is_ok());
        assert!(mx.check_tax_id("ABC01010").is_err());
    }

    #[test]
    fn rates_and_numbers_checked() {
        let doc = CanonicalDocument::new(json!({
            "doc_type": "invoice",
            "country": "ec",
            "currency": "USD",
            "invoice_number": "F-123",
            "vendor": {"name": "Andina", "tax_id": "1790011674001"},
            "totals": {"subtotal": 100, "tax": 7, "total": 107, "tax_rate": 7,
                       "tax_breakdown": [{"rate": 0.15, "base": 100}]}
        }));
        let (ok, errors) = validate_country_rules(&doc);
        assert!(!ok);
        assert_eq!(errors.len(), 2, "{:?}", errors);
        assert!(errors.iter().any(|e| e.starts_with("totals.tax_rate")));
        assert!(errors.iter().any(|e| e.starts_with("invoice_number")));
    }

    #[test]
    fn unknown_country_has_no_rules() {
        let doc = CanonicalDocument::new(json!({"doc_type": "invoice", "country": "US"}));
        assert_eq!(validate_country_rules(&doc), (true, vec![]));
    }
}
