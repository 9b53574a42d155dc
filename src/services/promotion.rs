//! Promotion dispatcher: canonical document → handler → destination table.

use crate::db::Db;
use crate::error::{PipelineError, Result};
use crate::models::{CanonicalDocument, DocType};
use crate::services::normalize::normalize_header;
use crate::services::row_normalizer::dedupe_hash;
use crate::types::{BatchStatus, ImportItem, ItemError, ItemStatus, PromotionSummary};
use crate::validators::validate_document;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Human-language names accepted wherever a doc type is named.
const ALIASES: &[(&str, DocType)] = &[
    ("factura", DocType::Invoice),
    ("facturas", DocType::Invoice),
    ("invoice", DocType::Invoice),
    ("recibo", DocType::Expense),
    ("gasto", DocType::Expense),
    ("gastos", DocType::Expense),
    ("ticket", DocType::ExpenseReceipt),
    ("recibo_gasto", DocType::ExpenseReceipt),
    ("receipt", DocType::ExpenseReceipt),
    ("movimiento", DocType::BankTx),
    ("banco", DocType::BankTx),
    ("bank", DocType::BankTx),
    ("transaccion", DocType::BankTx),
    ("bank_transaction", DocType::BankTx),
    ("producto", DocType::Product),
    ("productos", DocType::Product),
    ("articulo", DocType::Product),
    ("item", DocType::Product),
];

/// Canonical name or alias → doc type. Case and accents are ignored.
pub fn resolve_doc_type(name: &str) -> Option<DocType> {
    let key = normalize_header(name);
    DocType::parse(&key).or_else(|| {
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, d)| *d)
    })
}

/// Writes one canonical document into its destination table.
pub trait PromotionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn target_table(&self) -> &'static str;

    /// Destination columns for `doc`. Errors name the missing field.
    fn columns(&self, doc: &CanonicalDocument) -> Result<Vec<(&'static str, SqlValue)>>;

    /// Insert (or find) the destination row; returns its id.
    fn promote(
        &self,
        db: &Db,
        tenant_id: &str,
        source_key: &str,
        doc: &CanonicalDocument,
    ) -> Result<String> {
        let columns = self.columns(doc)?;
        let id = db
            .insert_destination(self.target_table(), tenant_id, source_key, &columns, doc.as_value())
            .map_err(|e| PipelineError::Promotion {
                target: self.target_table().to_string(),
                message: e.to_string(),
            })?;
        Ok(id.to_string())
    }
}

fn text(doc: &CanonicalDocument, path: &str) -> SqlValue {
    doc.get_str(path)
        .map(|s| SqlValue::Text(s.to_string()))
        .unwrap_or(SqlValue::Null)
}

fn real(doc: &CanonicalDocument, path: &str) -> SqlValue {
    doc.get_f64(path).map(SqlValue::Real).unwrap_or(SqlValue::Null)
}

fn required_text(doc: &CanonicalDocument, table: &str, path: &str) -> Result<SqlValue> {
    match text(doc, path) {
        SqlValue::Null => Err(missing(table, path)),
        v => Ok(v),
    }
}

fn required_real(doc: &CanonicalDocument, table: &str, path: &str) -> Result<SqlValue> {
    match real(doc, path) {
        SqlValue::Null => Err(missing(table, path)),
        v => Ok(v),
    }
}

fn missing(table: &str, path: &str) -> PipelineError {
    PipelineError::Promotion {
        target: table.to_string(),
        message: format!("{}: required field is missing", path),
    }
}

fn location(doc: &CanonicalDocument, table: &str) -> Result<Vec<(&'static str, SqlValue)>> {
    Ok(vec![
        ("country", required_text(doc, table, "country")?),
        ("currency", required_text(doc, table, "currency")?),
    ])
}

pub struct InvoiceHandler;
pub struct ExpenseHandler;
pub struct ExpenseReceiptHandler;
pub struct BankMovementHandler;
pub struct ProductHandler;

impl PromotionHandler for InvoiceHandler {
    fn name(&self) -> &'static str {
        "InvoiceHandler"
    }

    fn target_table(&self) -> &'static str {
        "invoices"
    }

    fn columns(&self, doc: &CanonicalDocument) -> Result<Vec<(&'static str, SqlValue)>> {
        let t = self.target_table();
        let mut cols = vec![
            ("invoice_number", required_text(doc, t, "invoice_number")?),
            ("issue_date", text(doc, "issue_date")),
            ("vendor_name", required_text(doc, t, "vendor.name")?),
            ("vendor_tax_id", text(doc, "vendor.tax_id")),
            ("subtotal", required_real(doc, t, "totals.subtotal")?),
            ("tax", required_real(doc, t, "totals.tax")?),
            ("total", required_real(doc, t, "totals.total")?),
        ];
        cols.extend(location(doc, t)?);
        Ok(cols)
    }
}

impl PromotionHandler for ExpenseHandler {
    fn name(&self) -> &'static str {
        "ExpenseHandler"
    }

    fn target_table(&self) -> &'static str {
        "expenses"
    }

    fn columns(&self, doc: &CanonicalDocument) -> Result<Vec<(&'static str, SqlValue)>> {
        let t = self.target_table();
        let mut cols = vec![
            ("kind", SqlValue::Text("expense".to_string())),
            ("expense_date", required_text(doc, t, "expense.date")?),
            ("description", required_text(doc, t, "expense.description")?),
            ("category", text(doc, "expense.category")),
            ("vendor_name", text(doc, "vendor.name")),
            ("amount", required_real(doc, t, "expense.amount")?),
            ("tax", real(doc, "expense.tax")),
        ];
        cols.extend(location(doc, t)?);
        Ok(cols)
    }
}

impl PromotionHandler for ExpenseReceiptHandler {
    fn name(&self) -> &'static str {
        "ExpenseReceiptHandler"
    }

    fn target_table(&self) -> &'static str {
        "expenses"
    }

    fn columns(&self, doc: &CanonicalDocument) -> Result<Vec<(&'static str, SqlValue)>> {
        let t = self.target_table();
        let mut cols = vec![
            ("kind", SqlValue::Text("receipt".to_string())),
            ("expense_date", required_text(doc, t, "issue_date")?),
            ("description", text(doc, "receipt_number")),
            ("vendor_name", required_text(doc, t, "vendor.name")?),
            ("amount", required_real(doc, t, "totals.total")?),
            ("tax", real(doc, "totals.tax")),
        ];
        cols.extend(location(doc, t)?);
        Ok(cols)
    }
}

impl PromotionHandler for BankMovementHandler {
    fn name(&self) -> &'static str {
        "BankMovementHandler"
    }

    fn target_table(&self) -> &'static str {
        "bank_movements"
    }

    fn columns(&self, doc: &CanonicalDocument) -> Result<Vec<(&'static str, SqlValue)>> {
        let t = self.target_table();
        let mut cols = vec![
            ("value_date", required_text(doc, t, "bank_tx.value_date")?),
            ("amount", required_real(doc, t, "bank_tx.amount")?),
            ("direction", required_text(doc, t, "bank_tx.direction")?),
            ("description", text(doc, "bank_tx.description")),
            ("reference", text(doc, "bank_tx.reference")),
            ("balance", real(doc, "bank_tx.balance")),
        ];
        cols.extend(location(doc, t)?);
        Ok(cols)
    }
}

impl PromotionHandler for ProductHandler {
    fn name(&self) -> &'static str {
        "ProductHandler"
    }

    fn target_table(&self) -> &'static str {
        "products"
    }

    fn columns(&self, doc: &CanonicalDocument) -> Result<Vec<(&'static str, SqlValue)>> {
        let t = self.target_table();
        Ok(vec![
            ("sku", text(doc, "product.sku")),
            ("name", required_text(doc, t, "product.name")?),
            ("price", required_real(doc, t, "product.price")?),
            ("cost", real(doc, "product.cost")),
            ("stock", real(doc, "product.stock")),
            ("tax_rate", real(doc, "product.tax_rate")),
        ])
    }
}

static INVOICE_HANDLER: InvoiceHandler = InvoiceHandler;
static EXPENSE_HANDLER: ExpenseHandler = ExpenseHandler;
static EXPENSE_RECEIPT_HANDLER: ExpenseReceiptHandler = ExpenseReceiptHandler;
static BANK_MOVEMENT_HANDLER: BankMovementHandler = BankMovementHandler;
static PRODUCT_HANDLER: ProductHandler = ProductHandler;

impl DocType {
    pub fn handler(&self) -> &'static dyn PromotionHandler {
        match self {
            DocType::Invoice => &INVOICE_HANDLER,
            DocType::Expense => &EXPENSE_HANDLER,
            DocType::ExpenseReceipt => &EXPENSE_RECEIPT_HANDLER,
            DocType::BankTx => &BANK_MOVEMENT_HANDLER,
            DocType::Product => &PRODUCT_HANDLER,
        }
    }

    pub fn target_table(&self) -> &'static str {
        self.handler().target_table()
    }
}

pub fn get_handler_for_type(doc_type_or_alias: &str) -> Result<&'static dyn PromotionHandler> {
    resolve_doc_type(doc_type_or_alias)
        .map(|d| d.handler())
        .ok_or_else(|| PipelineError::NotFound(format!("handler for doc type '{}'", doc_type_or_alias)))
}

pub fn get_target_for_type(doc_type_or_alias: &str) -> Result<&'static str> {
    get_handler_for_type(doc_type_or_alias).map(|h| h.target_table())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionTarget {
    pub target: String,
    pub domain_id: String,
}

/// Outcome of promoting one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemPromotion {
    Promoted(PromotionTarget),
    /// Item was already PROMOTED; nothing written.
    AlreadyPromoted(PromotionTarget),
    /// Re-validation failed; item is now ERROR_VALIDATION.
    Invalid { errors: Vec<String> },
}

pub struct PromotionDispatcher {
    db: Arc<Db>,
}

impl PromotionDispatcher {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Write a standalone document. The source key is its content hash, so
    /// promoting identical content twice yields the same id.
    pub fn promote_canonical(&self, tenant_id: &str, doc: &CanonicalDocument) -> Result<PromotionTarget> {
        let report = validate_document(doc);
        if !report.is_valid() {
            return Err(PipelineError::Validation(report.all_errors()));
        }
        let doc_type = doc
            .doc_type()
            .ok_or_else(|| PipelineError::Validation(vec!["doc_type: unsupported value".to_string()]))?;
        let source_key = match doc.as_value().as_object() {
            Some(map) => dedupe_hash(map),
            None => return Err(PipelineError::Validation(vec!["document is not an object".to_string()])),
        };
        let handler = doc_type.handler();
        let domain_id = handler.promote(&self.db, tenant_id, &source_key, doc)?;
        Ok(PromotionTarget {
            target: handler.target_table().to_string(),
            domain_id,
        })
    }

    /// Promote one import item. Handler failures mark the item ERROR_PROMOTION
    /// and are returned; the item can be retried.
    pub fn promote_item(&self, tenant_id: &str, item_id: i64) -> Result<ItemPromotion> {
        let item = self.db.get_item(tenant_id, item_id)?;
        self.promote_loaded(tenant_id, &item)
    }

    fn promote_loaded(&self, tenant_id: &str, item: &ImportItem) -> Result<ItemPromotion> {
        if item.status == ItemStatus::Promoted {
            if let (Some(target), Some(domain_id)) = (&item.promoted_to, &item.promoted_id) {
                return Ok(ItemPromotion::AlreadyPromoted(PromotionTarget {
                    target: target.clone(),
                    domain_id: domain_id.clone(),
                }));
            }
        }
        let Some(doc) = &item.canonical_doc else {
            return Err(PipelineError::Validation(vec![
                "canonical_doc: required field is missing".to_string(),
            ]));
        };

        let report = validate_document(doc);
        if !report.is_valid() {
            let errors = report.all_errors();
            self.db.update_item_status(
                tenant_id,
                item.id,
                ItemStatus::ErrorValidation,
                &report.to_item_errors(),
            )?;
            return Ok(ItemPromotion::Invalid { errors });
        }

        let Some(doc_type) = doc.doc_type() else {
            return Ok(ItemPromotion::Invalid {
                errors: vec!["doc_type: unsupported value".to_string()],
            });
        };
        let handler = doc_type.handler();
        match handler.promote(&self.db, tenant_id, &item.idempotency_key, doc) {
            Ok(domain_id) => {
                self.db
                    .mark_item_promoted(tenant_id, item.id, handler.target_table(), &domain_id)?;
                tracing::debug!(
                    tenant_id,
                    item_id = item.id,
                    target = handler.target_table(),
                    domain_id = %domain_id,
                    "item promoted"
                );
                Ok(ItemPromotion::Promoted(PromotionTarget {
                    target: handler.target_table().to_string(),
                    domain_id,
                }))
            }
            Err(e) => {
                tracing::warn!(tenant_id, item_id = item.id, error = %e, "promotion failed");
                self.db.update_item_status(
                    tenant_id,
                    item.id,
                    ItemStatus::ErrorPromotion,
                    &[ItemError::new("promotion", e.to_string())],
                )?;
                Err(e)
            }
        }
    }

    /// Promote every OK / ERROR_VALIDATION item that has a canonical document.
    /// Per-item failures are counted, never fatal; the batch always ends PROMOTED.
    pub fn promote_batch(&self, tenant_id: &str, batch_id: i64) -> Result<PromotionSummary> {
        self.promote_batch_with(tenant_id, batch_id, |_| true)
    }

    /// As [`promote_batch`](Self::promote_batch); `on_progress` sees the running
    /// summary after each item and returns `false` to stop early.
    pub fn promote_batch_with<F>(
        &self,
        tenant_id: &str,
        batch_id: i64,
        mut on_progress: F,
    ) -> Result<PromotionSummary>
    where
        F: FnMut(&PromotionSummary) -> bool,
    {
        self.db.get_batch(tenant_id, batch_id)?;
        self.db
            .set_batch_status(tenant_id, batch_id, BatchStatus::Promoting)?;
        tracing::info!(tenant_id, batch_id, "promoting batch");

        let mut summary = PromotionSummary::default();
        let mut stopped = false;
        for item in self.db.list_items(tenant_id, batch_id, None)? {
            let eligible = matches!(item.status, ItemStatus::Ok | ItemStatus::ErrorValidation)
                && item.canonical_doc.is_some();
            if !eligible {
                summary.skipped += 1;
            } else {
                match self.promote_loaded(tenant_id, &item) {
                    Ok(ItemPromotion::Promoted(_)) | Ok(ItemPromotion::AlreadyPromoted(_)) => {
                        summary.promoted += 1
                    }
                    Ok(ItemPromotion::Invalid { .. }) => summary.failed += 1,
                    Err(PipelineError::Promotion { .. }) => summary.failed += 1,
                    Err(e) => return Err(e),
                }
            }
            if !on_progress(&summary) {
                stopped = true;
                break;
            }
        }

        self.db.merge_batch_summary(
            tenant_id,
            batch_id,
            &json!({ "promotion": summary, "promotion_stopped": stopped }),
        )?;
        self.db
            .set_batch_status(tenant_id, batch_id, BatchStatus::Promoted)?;
        tracing::info!(
            tenant_id,
            batch_id,
            promoted = summary.promoted,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch promotion finished"
        );
        Ok(summary)
    }
}
