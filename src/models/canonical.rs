use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Countries whose documents the pipeline accepts (ISO 3166 alpha-2).
pub const SUPPORTED_COUNTRIES: &[&str] = &["EC", "ES", "MX", "CO", "PE", "CL", "AR", "US"];

/// Currencies the pipeline accepts (ISO 4217).
pub const SUPPORTED_CURRENCIES: &[&str] = &["USD", "EUR", "MXN", "COP", "PEN", "CLP", "ARS"];

/// Closed set of business document types the pipeline can promote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Invoice,
    Expense,
    ExpenseReceipt,
    BankTx,
    Product,
}

impl DocType {
    pub const ALL: [DocType; 5] = [
        DocType::Invoice,
        DocType::Expense,
        DocType::ExpenseReceipt,
        DocType::BankTx,
        DocType::Product,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Invoice => "invoice",
            DocType::Expense => "expense",
            DocType::ExpenseReceipt => "expense_receipt",
            DocType::BankTx => "bank_tx",
            DocType::Product => "product",
        }
    }

    /// Exact canonical name lookup (no aliases).
    pub fn parse(name: &str) -> Option<DocType> {
        DocType::ALL.into_iter().find(|d| d.as_str() == name)
    }

    /// Fields a document of this type must carry, as dotted paths.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            DocType::Invoice => &[
                "invoice_number",
                "vendor.name",
                "totals.subtotal",
                "totals.tax",
                "totals.total",
            ],
            DocType::Expense => &["expense.date", "expense.amount", "expense.description"],
            DocType::ExpenseReceipt => &["vendor.name", "issue_date", "totals.total"],
            DocType::BankTx => &["bank_tx.amount", "bank_tx.direction", "bank_tx.value_date"],
            DocType::Product => &["product.name", "product.price"],
        }
    }

    /// Every canonical field a column may be mapped onto for this type.
    pub fn canonical_fields(&self) -> &'static [&'static str] {
        match self {
            DocType::Invoice => &[
                "invoice_number",
                "issue_date",
                "due_date",
                "vendor.name",
                "vendor.tax_id",
                "vendor.country",
                "customer.name",
                "customer.tax_id",
                "totals.subtotal",
                "totals.tax",
                "totals.tax_rate",
                "totals.total",
                "description",
            ],
            DocType::Expense => &[
                "expense.date",
                "expense.amount",
                "expense.tax",
                "expense.description",
                "expense.category",
                "expense.payment_method",
                "vendor.name",
                "vendor.tax_id",
            ],
            DocType::ExpenseReceipt => &[
                "receipt_number",
                "issue_date",
                "vendor.name",
                "vendor.tax_id",
                "totals.subtotal",
                "totals.tax",
                "totals.tax_rate",
                "totals.total",
                "payment_method",
            ],
            DocType::BankTx => &[
                "bank_tx.value_date",
                "bank_tx.amount",
                "bank_tx.direction",
                "bank_tx.description",
                "bank_tx.reference",
                "bank_tx.balance",
                "bank_tx.account",
                "bank_tx.counterparty",
            ],
            DocType::Product => &[
                "product.sku",
                "product.name",
                "product.description",
                "product.price",
                "product.cost",
                "product.stock",
                "product.category",
                "product.unit",
                "product.tax_rate",
                "product.barcode",
            ],
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label used wherever a doc type may be unknown.
pub fn doc_type_label(doc_type: Option<DocType>) -> &'static str {
    doc_type.map(|d| d.as_str()).unwrap_or("generic")
}

pub fn is_supported_country(code: &str) -> bool {
    SUPPORTED_COUNTRIES.iter().any(|c| c.eq_ignore_ascii_case(code))
}

pub fn is_supported_currency(code: &str) -> bool {
    SUPPORTED_CURRENCIES.iter().any(|c| c.eq_ignore_ascii_case(code))
}

/// The pipeline's normalized, doc_type-tagged record.
///
/// Kept as a JSON object so that structurally broken input can still be
/// represented, inspected and reported on field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalDocument(Value);

impl CanonicalDocument {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Empty document carrying only the three top-level fields.
    pub fn with_header(doc_type: DocType, country: &str, currency: &str) -> Self {
        let mut map = Map::new();
        map.insert("doc_type".into(), Value::String(doc_type.as_str().into()));
        map.insert("country".into(), Value::String(country.to_uppercase()));
        map.insert("currency".into(), Value::String(currency.to_uppercase()));
        Self(Value::Object(map))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Resolve a dotted path (`totals.total`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.0, |node, key| node.as_object()?.get(key))
    }

    /// Non-blank string at `path`.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Finite number at `path`; numeric strings are accepted.
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        let n = match self.get(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        n.filter(|v| v.is_finite())
    }

    /// Insert `value` at a dotted path, creating intermediate objects.
    /// A non-object intermediate is replaced.
    pub fn set(&mut self, path: &str, value: Value) {
        let parts: Vec<&str> = path.split('.').collect();
        set_path(&mut self.0, &parts, value);
    }

    /// Remove the value at a dotted path, returning it.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parent, leaf) = match path.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, path),
        };
        let target = match parent {
            Some(p) => p
                .split('.')
                .try_fold(&mut self.0, |node, key| node.as_object_mut()?.get_mut(key))?,
            None => &mut self.0,
        };
        target.as_object_mut()?.remove(leaf)
    }

    pub fn doc_type_name(&self) -> Option<&str> {
        self.get_str("doc_type")
    }

    pub fn doc_type(&self) -> Option<DocType> {
        self.doc_type_name().and_then(DocType::parse)
    }

    pub fn country(&self) -> Option<&str> {
        self.get_str("country")
    }

    pub fn currency(&self) -> Option<&str> {
        self.get_str("currency")
    }
}

fn set_path(node: &mut Value, parts: &[&str], value: Value) {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    match parts {
        [] => {}
        [leaf] => {
            map.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, value);
        }
    }
}
