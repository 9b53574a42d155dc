//! Header and cell-value normalization shared by the classifier, mapper and learner.

use chrono::{Duration, NaiveDate};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Lowercase, strip accents, collapse punctuation/whitespace runs to `_`.
///
/// `"Fecha de Emisión"` → `"fecha_de_emision"`, `"Nº Factura."` → `"no_factura"`.
pub fn normalize_header(header: &str) -> String {
    let folded: String = header
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(|c| c.to_lowercase())
        .collect();
    let mut out = String::with_capacity(folded.len());
    let mut pending_sep = false;
    for c in folded.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Normalized header split into its `_` separated tokens.
pub fn header_tokens(header: &str) -> Vec<String> {
    normalize_header(header)
        .split('_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a human-formatted amount.
///
/// Handles currency symbols, `1.234,56` and `1,234.56` grouping, accounting
/// parentheses and trailing minus.
pub fn parse_number(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let mut negative = false;
    let mut body = s;
    if body.starts_with('(') && body.ends_with(')') {
        negative = true;
        body = &body[1..body.len() - 1];
    }
    let mut cleaned: String = body
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();
    if cleaned.ends_with('-') {
        negative = !negative;
        cleaned.pop();
    }
    if cleaned.starts_with('-') {
        negative = !negative;
        cleaned.remove(0);
    } else if cleaned.starts_with('+') {
        cleaned.remove(0);
    }
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(c)) => {
            // "1,234" is grouping, "12,5" is a decimal comma
            let decimals = cleaned.len() - c - 1;
            if decimals == 3 && c > 0 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (Some(_), None) => {
            if cleaned.matches('.').count() > 1 {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };
    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d/%m/%y", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d", "%d.%m.%Y", "%Y%m%d",
];

/// Parse a date in common Latin-American/European formats or as a spreadsheet serial.
/// Returns `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    // Drop a time component ("2024-03-01 00:00:00", "2024-03-01T10:00:00")
    let date_part = s.split(['T', ' ']).next().unwrap_or(s);
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(date_part, fmt) {
            return Some(d.format("%Y-%m-%d").to_string());
        }
    }
    if let Ok(serial) = s.parse::<f64>() {
        return excel_serial_to_date(serial);
    }
    None
}

/// Spreadsheet serial day number (1900 date system) to `YYYY-MM-DD`.
pub fn excel_serial_to_date(serial: f64) -> Option<String> {
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_signed(Duration::days(serial.trunc() as i64))?;
    Some(date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_normalization() {
        assert_eq!(normalize_header("Fecha de Emisión"), "fecha_de_emision");
        assert_eq!(normalize_header("  Nº Factura. "), "no_factura");
        assert_eq!(normalize_header("TOTAL (USD)"), "total_usd");
        assert_eq!(normalize_header("precio--unitario"), "precio_unitario");
        assert_eq!(normalize_header("***"), "");
    }

    #[test]
    fn number_formats() {
        assert_eq!(parse_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_number("$ 99.90"), Some(99.90));
        assert_eq!(parse_number("12,5"), Some(12.5));
        assert_eq!(parse_number("(150.00)"), Some(-150.0));
        assert_eq!(parse_number("150.00-"), Some(-150.0));
        assert_eq!(parse_number("-42"), Some(-42.0));
        assert_eq!(parse_number("1.000.000"), Some(1_000_000.0));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn date_formats() {
        assert_eq!(parse_date("2024-03-15").as_deref(), Some("2024-03-15"));
        assert_eq!(parse_date("15/03/2024").as_deref(), Some("2024-03-15"));
        assert_eq!(parse_date("15-03-2024").as_deref(), Some("2024-03-15"));
        assert_eq!(parse_date("15.03.2024").as_deref(), Some("2024-03-15"));
        assert_eq!(parse_date("2024-03-15 10:22:00").as_deref(), Some("2024-03-15"));
        assert_eq!(parse_date("45366").as_deref(), Some("2024-03-15"));
        assert_eq!(parse_date("not a date"), None);
    }
}
