//! Static bilingual synonym tables and the heuristic header mapper.

use super::normalize::normalize_header;
use crate::models::{DocType, MappingProvider, MappingSuggestion};
use std::collections::{BTreeMap, HashSet};

type SynonymTable = &'static [(&'static str, &'static [&'static str])];

const INVOICE: SynonymTable = &[
    (
        "invoice_number",
        &[
            "numero_factura", "no_factura", "nro_factura", "num_factura", "n_factura", "factura",
            "invoice_number", "invoice_no", "invoice", "numero_comprobante", "comprobante",
            "secuencial", "folio", "document_number", "numero", "nro",
        ],
    ),
    (
        "issue_date",
        &[
            "fecha_emision", "fecha_de_emision", "fecha_factura", "invoice_date", "issue_date",
            "emision", "fecha", "date",
        ],
    ),
    ("due_date", &["fecha_vencimiento", "fecha_de_vencimiento", "vencimiento", "due_date", "due"]),
    (
        "vendor.name",
        &[
            "razon_social_emisor", "nombre_proveedor", "razon_social", "proveedor", "emisor",
            "vendedor", "vendor_name", "supplier_name", "vendor", "supplier", "seller",
        ],
    ),
    (
        "vendor.tax_id",
        &[
            "ruc_emisor", "ruc_proveedor", "identificacion_emisor", "tax_id", "vat_number",
            "vat_id", "ruc", "nif", "cif", "rfc", "nit",
        ],
    ),
    ("vendor.country", &["pais_proveedor", "pais", "country"]),
    (
        "customer.name",
        &[
            "razon_social_comprador", "nombre_cliente", "cliente", "comprador", "customer", "buyer",
        ],
    ),
    (
        "customer.tax_id",
        &[
            "ruc_cliente", "ruc_comprador", "identificacion_comprador", "cedula_cliente",
            "nif_cliente", "customer_tax_id",
        ],
    ),
    (
        "totals.subtotal",
        &[
            "subtotal_sin_impuestos", "base_imponible", "importe_neto", "net_amount", "subtotal",
            "sub_total", "neto", "base", "net",
        ],
    ),
    ("totals.tax_rate", &["tasa_iva", "porcentaje_iva", "tarifa_iva", "iva_porcentaje", "tax_rate", "vat_rate"]),
    (
        "totals.tax",
        &["monto_iva", "valor_iva", "total_iva", "tax_amount", "impuestos", "impuesto", "iva", "tax", "vat"],
    ),
    (
        "totals.total",
        &[
            "importe_total", "valor_total", "monto_total", "total_factura", "grand_total",
            "total_amount", "total", "importe", "amount",
        ],
    ),
    ("description", &["descripcion", "concepto", "detalle", "description", "observaciones"]),
];

const EXPENSE: SynonymTable = &[
    ("expense.date", &["fecha_gasto", "expense_date", "fecha_pago", "fecha", "date"]),
    ("expense.amount", &["monto", "importe", "valor", "amount", "total", "gasto"]),
    ("expense.tax", &["impuesto", "iva", "tax", "vat"]),
    ("expense.description", &["descripcion", "concepto", "detalle", "description", "motivo", "glosa"]),
    ("expense.category", &["tipo_gasto", "categoria", "category", "rubro", "cuenta", "tipo"]),
    ("expense.payment_method", &["forma_pago", "metodo_pago", "medio_pago", "payment_method"]),
    ("vendor.name", &["proveedor", "establecimiento", "comercio", "vendor", "merchant", "supplier"]),
    ("vendor.tax_id", &["tax_id", "ruc", "nif", "cif", "rfc", "nit"]),
];

const EXPENSE_RECEIPT: SynonymTable = &[
    (
        "receipt_number",
        &["numero_recibo", "numero_ticket", "receipt_number", "receipt_no", "recibo", "ticket", "folio", "numero"],
    ),
    ("issue_date", &["fecha_emision", "receipt_date", "fecha", "date"]),
    ("vendor.name", &["establecimiento", "comercio", "proveedor", "tienda", "merchant", "vendor", "store"]),
    ("vendor.tax_id", &["tax_id", "ruc", "nif", "cif", "rfc", "nit"]),
    ("totals.subtotal", &["base_imponible", "subtotal", "base", "net"]),
    ("totals.tax_rate", &["tasa_iva", "porcentaje_iva", "tax_rate"]),
    ("totals.tax", &["impuesto", "iva", "tax", "vat"]),
    ("totals.total", &["total_pagado", "importe_total", "total", "importe", "monto", "amount"]),
    ("payment_method", &["forma_pago", "metodo_pago", "payment_method", "pago"]),
];

const BANK_TX: SynonymTable = &[
    (
        "bank_tx.value_date",
        &[
            "fecha_valor", "f_valor", "fecha_operacion", "fecha_movimiento", "value_date",
            "transaction_date", "fecha", "date",
        ],
    ),
    ("bank_tx.amount", &["monto_movimiento", "importe", "monto", "valor", "amount", "cantidad"]),
    (
        "bank_tx.direction",
        &["tipo_movimiento", "debe_haber", "cargo_abono", "naturaleza", "direction", "tipo", "type", "dc"],
    ),
    ("bank_tx.description", &["descripcion", "concepto", "description", "detalle", "glosa", "memo", "narrative"]),
    ("bank_tx.reference", &["numero_documento", "referencia", "reference", "documento", "comprobante", "ref"]),
    ("bank_tx.balance", &["saldo_disponible", "running_balance", "saldo", "balance"]),
    ("bank_tx.account", &["numero_cuenta", "account_number", "cuenta", "account", "iban"]),
    ("bank_tx.counterparty", &["beneficiario", "ordenante", "contraparte", "counterparty", "payee", "tercero"]),
];

const PRODUCT: SynonymTable = &[
    ("product.barcode", &["codigo_barras", "codigo_de_barras", "barcode", "ean", "upc", "gtin"]),
    (
        "product.sku",
        &["codigo_producto", "product_code", "item_code", "sku", "codigo", "cod", "code", "referencia", "ref", "clave"],
    ),
    (
        "product.name",
        &["nombre_producto", "product_name", "nombre", "producto", "articulo", "name", "product", "item"],
    ),
    ("product.description", &["descripcion", "description", "detalle"]),
    (
        "product.price",
        &["precio_unitario", "precio_venta", "valor_unitario", "unit_price", "sale_price", "precio", "pvp", "price"],
    ),
    ("product.cost", &["costo_unitario", "precio_compra", "purchase_price", "costo", "coste", "cost"]),
    ("product.stock", &["unidades_disponibles", "existencias", "inventario", "stock", "cantidad", "quantity", "qty"]),
    ("product.category", &["categoria", "category", "familia", "linea", "grupo"]),
    ("product.unit", &["unidad_medida", "unidad", "unit", "uom"]),
    ("product.tax_rate", &["tasa_iva", "porcentaje_iva", "tax_rate", "impuesto", "iva", "vat"]),
];

/// Synonym table for a document type, in declaration (priority) order.
pub fn synonyms_for(doc_type: DocType) -> SynonymTable {
    match doc_type {
        DocType::Invoice => INVOICE,
        DocType::Expense => EXPENSE,
        DocType::ExpenseReceipt => EXPENSE_RECEIPT,
        DocType::BankTx => BANK_TX,
        DocType::Product => PRODUCT,
    }
}

/// True when every `_` token of `synonym` appears contiguously in `tokens`.
pub(crate) fn contains_word_sequence(tokens: &[&str], synonym: &str) -> bool {
    let needle: Vec<&str> = synonym.split('_').collect();
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Best unused canonical field for one normalized header.
///
/// Exact synonym match first, then whole-word match, then substring match;
/// within a phase the longest synonym wins, then declaration order.
fn match_header(
    normalized: &str,
    table: SynonymTable,
    used: &HashSet<&'static str>,
) -> Option<&'static str> {
    if normalized.is_empty() {
        return None;
    }
    let candidates = table.iter().filter(|(field, _)| !used.contains(field));

    for (field, synonyms) in candidates.clone() {
        if synonyms.contains(&normalized) {
            return Some(*field);
        }
    }

    let tokens: Vec<&str> = normalized.split('_').collect();
    let mut best: Option<(&'static str, usize)> = None;
    for (field, synonyms) in candidates.clone() {
        for syn in synonyms.iter() {
            if contains_word_sequence(&tokens, syn)
                && best.map(|(_, len)| syn.len() > len).unwrap_or(true)
            {
                best = Some((*field, syn.len()));
            }
        }
    }
    if let Some((field, _)) = best {
        return Some(field);
    }

    for (field, synonyms) in candidates {
        for syn in synonyms.iter() {
            if syn.len() >= 4
                && normalized.contains(syn)
                && best.map(|(_, len)| syn.len() > len).unwrap_or(true)
            {
                best = Some((*field, syn.len()));
            }
        }
    }
    best.map(|(field, _)| field)
}

/// Dictionary mapping of `headers` for `doc_type`.
///
/// Headers are processed in order; a canonical field is taken by the first
/// header that matches it. Confidence is the fraction of headers mapped.
pub fn heuristic_mapping(headers: &[String], doc_type: DocType) -> MappingSuggestion {
    let table = synonyms_for(doc_type);
    let mut used: HashSet<&'static str> = HashSet::new();
    let mut mappings = BTreeMap::new();
    for header in headers {
        let normalized = normalize_header(header);
        if let Some(field) = match_header(&normalized, table, &used) {
            used.insert(field);
            mappings.insert(header.clone(), field.to_string());
        }
    }
    let mut suggestion = MappingSuggestion::empty(doc_type, MappingProvider::Heuristics);
    suggestion.mappings = mappings;
    suggestion.confidence = suggestion.coverage(headers);
    suggestion.derive_transforms();
    suggestion
}
