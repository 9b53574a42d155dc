use crate::error::{PipelineError, Result};
use crate::models::{CanonicalDocument, DocType, FieldStats, MappingFeedback, StatsKey};
use crate::services::classifier::ClassificationFeedback;
use crate::services::learner::StatsStore;
use crate::types::{
    BatchStatus, ImportBatch, ImportItem, ItemError, ItemStatus, NewImportItem,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_VERSION: i64 = 2;

pub struct Db {
    conn: Mutex<Connection>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Db {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            INSERT INTO schema_version (version) SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version LIMIT 1);
            CREATE TABLE IF NOT EXISTS import_batches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_digest TEXT,
                doc_type TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                summary TEXT
            );
            CREATE TABLE IF NOT EXISTS import_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                batch_id INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                raw TEXT NOT NULL,
                normalized TEXT NOT NULL,
                canonical_doc TEXT,
                status TEXT NOT NULL,
                errors TEXT NOT NULL DEFAULT '[]',
                idempotency_key TEXT NOT NULL,
                dedupe_hash TEXT NOT NULL,
                promoted_to TEXT,
                promoted_id TEXT,
                promoted_at TEXT,
                FOREIGN KEY (batch_id) REFERENCES import_batches(id) ON DELETE CASCADE,
                UNIQUE (tenant_id, batch_id, idx),
                UNIQUE (tenant_id, idempotency_key)
            );
            CREATE INDEX IF NOT EXISTS idx_import_items_batch ON import_items(tenant_id, batch_id, status);
            CREATE TABLE IF NOT EXISTS mapping_feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                headers TEXT NOT NULL,
                fields TEXT NOT NULL,
                feedback_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS mapping_stats (
                tenant_id TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                normalized_header TEXT NOT NULL,
                canonical_field TEXT NOT NULL,
                correct_count INTEGER NOT NULL DEFAULT 0,
                total_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, doc_type, normalized_header, canonical_field)
            );
            ",
        )?;

        // Normalize schema_version to a single row
        conn.execute(
            "DELETE FROM schema_version WHERE version < (SELECT MAX(version) FROM schema_version)",
            [],
        )?;

        // Migration 002: classification feedback and destination tables
        let current_version: i64 =
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))?;
        if current_version < 2 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS classification_feedback (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    headers TEXT NOT NULL,
                    predicted TEXT,
                    actual TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS invoices (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    source_key TEXT NOT NULL,
                    invoice_number TEXT NOT NULL,
                    issue_date TEXT,
                    vendor_name TEXT NOT NULL,
                    vendor_tax_id TEXT,
                    subtotal REAL NOT NULL,
                    tax REAL NOT NULL,
                    total REAL NOT NULL CHECK (total >= 0),
                    country TEXT NOT NULL,
                    currency TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (tenant_id, source_key)
                );
                CREATE TABLE IF NOT EXISTS expenses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    source_key TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    expense_date TEXT,
                    description TEXT,
                    category TEXT,
                    vendor_name TEXT,
                    amount REAL NOT NULL CHECK (amount >= 0),
                    tax REAL,
                    country TEXT NOT NULL,
                    currency TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (tenant_id, source_key)
                );
                CREATE TABLE IF NOT EXISTS bank_movements (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    source_key TEXT NOT NULL,
                    value_date TEXT NOT NULL,
                    amount REAL NOT NULL CHECK (amount >= 0),
                    direction TEXT NOT NULL CHECK (direction IN ('debit', 'credit')),
                    description TEXT,
                    reference TEXT,
                    balance REAL,
                    country TEXT NOT NULL,
                    currency TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (tenant_id, source_key)
                );
                CREATE TABLE IF NOT EXISTS products (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    source_key TEXT NOT NULL,
                    sku TEXT,
                    name TEXT NOT NULL,
                    price REAL NOT NULL CHECK (price >= 0),
                    cost REAL,
                    stock REAL,
                    tax_rate REAL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (tenant_id, source_key)
                );
                ",
            )?;
            conn.execute("UPDATE schema_version SET version = ?1", params![SCHEMA_VERSION])?;
        }

        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Internal("database lock poisoned".to_string()))
    }

    // ---- batches ----

    pub fn create_batch(
        &self,
        tenant_id: &str,
        file_name: &str,
        file_digest: Option<&str>,
        doc_type: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO import_batches (tenant_id, file_name, file_digest, doc_type, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tenant_id,
                file_name,
                file_digest,
                doc_type,
                BatchStatus::Pending.as_str(),
                now()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest batch of `tenant_id` created from a file with this content digest.
    pub fn find_batch_by_digest(&self, tenant_id: &str, file_digest: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id FROM import_batches WHERE tenant_id = ?1 AND file_digest = ?2
                 ORDER BY id DESC LIMIT 1",
                params![tenant_id, file_digest],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn get_batch(&self, tenant_id: &str, batch_id: i64) -> Result<ImportBatch> {
        let conn = self.lock()?;
        let batch = conn
            .query_row(
                "SELECT id, tenant_id, file_name, file_digest, doc_type, status, created_at, summary
                 FROM import_batches WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, batch_id],
                |r| {
                    let status: String = r.get(5)?;
                    let summary: Option<String> = r.get(7)?;
                    Ok(ImportBatch {
                        id: r.get(0)?,
                        tenant_id: r.get(1)?,
                        file_name: r.get(2)?,
                        file_digest: r.get(3)?,
                        doc_type: r.get(4)?,
                        status: BatchStatus::parse(&status).unwrap_or(BatchStatus::Failed),
                        created_at: r.get(6)?,
                        summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
                    })
                },
            )
            .optional()?;
        batch.ok_or_else(|| PipelineError::NotFound(format!("batch {}", batch_id)))
    }

    pub fn set_batch_status(&self, tenant_id: &str, batch_id: i64, status: BatchStatus) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE import_batches SET status = ?1 WHERE tenant_id = ?2 AND id = ?3",
            params![status.as_str(), tenant_id, batch_id],
        )?;
        if n == 0 {
            return Err(PipelineError::NotFound(format!("batch {}", batch_id)));
        }
        Ok(())
    }

    pub fn set_batch_doc_type(&self, tenant_id: &str, batch_id: i64, doc_type: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE import_batches SET doc_type = ?1 WHERE tenant_id = ?2 AND id = ?3",
            params![doc_type, tenant_id, batch_id],
        )?;
        Ok(())
    }

    /// Merge `patch` into the batch summary object.
    pub fn merge_batch_summary(&self, tenant_id: &str, batch_id: i64, patch: &Value) -> Result<()> {
        let conn = self.lock()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT summary FROM import_batches WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, batch_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {}", batch_id)))?;
        let mut summary = current
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .filter(|v| v.is_object())
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let (Some(target), Some(source)) = (summary.as_object_mut(), patch.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        conn.execute(
            "UPDATE import_batches SET summary = ?1 WHERE tenant_id = ?2 AND id = ?3",
            params![summary.to_string(), tenant_id, batch_id],
        )?;
        Ok(())
    }

    // ---- items ----

    /// Write one chunk of items in a single transaction. Rows whose
    /// idempotency key already exists for the tenant are skipped.
    /// Returns the number of rows actually inserted.
    pub fn insert_items(
        &self,
        tenant_id: &str,
        batch_id: i64,
        items: &[NewImportItem],
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut created = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO import_items
                 (tenant_id, batch_id, idx, raw, normalized, canonical_doc, status, errors, idempotency_key, dedupe_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for item in items {
                let canonical = item
                    .canonical_doc
                    .as_ref()
                    .map(|d| serde_json::to_string(d))
                    .transpose()?;
                created += stmt.execute(params![
                    tenant_id,
                    batch_id,
                    item.idx,
                    serde_json::to_string(&item.raw)?,
                    serde_json::to_string(&item.normalized)?,
                    canonical,
                    item.status.as_str(),
                    serde_json::to_string(&item.errors)?,
                    item.idempotency_key,
                    item.dedupe_hash,
                ])?;
            }
        }
        tx.commit()?;
        Ok(created)
    }

    const ITEM_COLUMNS: &'static str = "id, tenant_id, batch_id, idx, raw, normalized, canonical_doc, status, errors,
         idempotency_key, dedupe_hash, promoted_to, promoted_id, promoted_at";

    fn item_from_row(r: &Row<'_>) -> rusqlite::Result<ImportItem> {
        let raw: String = r.get(4)?;
        let normalized: String = r.get(5)?;
        let canonical: Option<String> = r.get(6)?;
        let status: String = r.get(7)?;
        let errors: String = r.get(8)?;
        Ok(ImportItem {
            id: r.get(0)?,
            tenant_id: r.get(1)?,
            batch_id: r.get(2)?,
            idx: r.get(3)?,
            raw: serde_json::from_str(&raw).unwrap_or_default(),
            normalized: serde_json::from_str(&normalized).unwrap_or_default(),
            canonical_doc: canonical.and_then(|c| serde_json::from_str::<CanonicalDocument>(&c).ok()),
            status: ItemStatus::parse(&status).unwrap_or(ItemStatus::Pending),
            errors: serde_json::from_str(&errors).unwrap_or_default(),
            idempotency_key: r.get(9)?,
            dedupe_hash: r.get(10)?,
            promoted_to: r.get(11)?,
            promoted_id: r.get(12)?,
            promoted_at: r.get(13)?,
        })
    }

    pub fn get_item(&self, tenant_id: &str, item_id: i64) -> Result<ImportItem> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM import_items WHERE tenant_id = ?1 AND id = ?2",
            Self::ITEM_COLUMNS
        );
        conn.query_row(&sql, params![tenant_id, item_id], Self::item_from_row)
            .optional()?
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", item_id)))
    }

    /// Items of a batch in row order, optionally filtered by status.
    pub fn list_items(
        &self,
        tenant_id: &str,
        batch_id: i64,
        status: Option<ItemStatus>,
    ) -> Result<Vec<ImportItem>> {
        let conn = self.lock()?;
        let items = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM import_items WHERE tenant_id = ?1 AND batch_id = ?2 AND status = ?3 ORDER BY idx",
                    Self::ITEM_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![tenant_id, batch_id, status.as_str()],
                    Self::item_from_row,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM import_items WHERE tenant_id = ?1 AND batch_id = ?2 ORDER BY idx",
                    Self::ITEM_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![tenant_id, batch_id], Self::item_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(items)
    }

    pub fn count_items_by_status(&self, tenant_id: &str, batch_id: i64) -> Result<BTreeMap<String, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM import_items WHERE tenant_id = ?1 AND batch_id = ?2 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![tenant_id, batch_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count.max(0) as u64);
        }
        Ok(out)
    }

    /// Set status and append `errors` to the item's error list.
    pub fn update_item_status(
        &self,
        tenant_id: &str,
        item_id: i64,
        status: ItemStatus,
        errors: &[ItemError],
    ) -> Result<()> {
        let conn = self.lock()?;
        let existing: String = conn
            .query_row(
                "SELECT errors FROM import_items WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, item_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", item_id)))?;
        let mut all: Vec<ItemError> = serde_json::from_str(&existing).unwrap_or_default();
        all.extend(errors.iter().cloned());
        conn.execute(
            "UPDATE import_items SET status = ?1, errors = ?2 WHERE tenant_id = ?3 AND id = ?4",
            params![status.as_str(), serde_json::to_string(&all)?, tenant_id, item_id],
        )?;
        Ok(())
    }

    /// Replace an item's canonical document after a human correction.
    pub fn update_item_canonical(
        &self,
        tenant_id: &str,
        item_id: i64,
        doc: &CanonicalDocument,
        status: ItemStatus,
    ) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE import_items SET canonical_doc = ?1, status = ?2
             WHERE tenant_id = ?3 AND id = ?4 AND status != 'PROMOTED'",
            params![serde_json::to_string(doc)?, status.as_str(), tenant_id, item_id],
        )?;
        if n == 0 {
            return Err(PipelineError::NotFound(format!("unpromoted item {}", item_id)));
        }
        Ok(())
    }

    pub fn mark_item_promoted(
        &self,
        tenant_id: &str,
        item_id: i64,
        target: &str,
        promoted_id: &str,
    ) -> Result<String> {
        let conn = self.lock()?;
        let at = now();
        conn.execute(
            "UPDATE import_items SET status = ?1, promoted_to = ?2, promoted_id = ?3, promoted_at = ?4
             WHERE tenant_id = ?5 AND id = ?6",
            params![
                ItemStatus::Promoted.as_str(),
                target,
                promoted_id,
                at,
                tenant_id,
                item_id
            ],
        )?;
        Ok(at)
    }

    // ---- destination tables ----

    /// Insert a destination row, or return the id of the row already written
    /// for `(tenant_id, source_key)`.
    pub fn insert_destination(
        &self,
        table: &'static str,
        tenant_id: &str,
        source_key: &str,
        columns: &[(&'static str, SqlValue)],
        payload: &Value,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let names: Vec<&str> = columns.iter().map(|(c, _)| *c).collect();
        let placeholders: Vec<String> = (0..columns.len()).map(|i| format!("?{}", i + 5)).collect();
        let sql = format!(
            "INSERT INTO {table} (tenant_id, source_key, payload, created_at{sep}{names})
             VALUES (?1, ?2, ?3, ?4{sep}{placeholders})
             ON CONFLICT(tenant_id, source_key) DO NOTHING",
            table = table,
            sep = if columns.is_empty() { "" } else { ", " },
            names = names.join(", "),
            placeholders = placeholders.join(", "),
        );
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(tenant_id.to_string()),
            SqlValue::Text(source_key.to_string()),
            SqlValue::Text(payload.to_string()),
            SqlValue::Text(now()),
        ];
        values.extend(columns.iter().map(|(_, v)| v.clone()));
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        let id = conn.query_row(
            &format!("SELECT id FROM {} WHERE tenant_id = ?1 AND source_key = ?2", table),
            params![tenant_id, source_key],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn count_destination_rows(&self, table: &'static str, tenant_id: &str) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE tenant_id = ?1", table),
            params![tenant_id],
            |r| r.get(0),
        )?)
    }

    // ---- classification feedback ----

    pub fn record_classification_feedback(&self, feedback: &ClassificationFeedback) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO classification_feedback (tenant_id, headers, predicted, actual, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                feedback.tenant_id,
                serde_json::to_string(&feedback.headers)?,
                feedback.predicted,
                feedback.actual.as_str(),
                now()
            ],
        )?;
        Ok(())
    }

    /// Every classification verdict, oldest first. Read by offline retraining only.
    pub fn classification_feedback(&self) -> Result<Vec<ClassificationFeedback>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, headers, predicted, actual FROM classification_feedback ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (tenant_id, headers, predicted, actual) = row?;
            let Some(actual) = DocType::parse(&actual) else {
                continue;
            };
            out.push(ClassificationFeedback {
                tenant_id,
                headers: serde_json::from_str(&headers).unwrap_or_default(),
                predicted,
                actual,
            });
        }
        Ok(out)
    }
}

impl StatsStore for Db {
    fn append_feedback(&self, feedback: &MappingFeedback) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO mapping_feedback (tenant_id, doc_type, headers, fields, feedback_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                feedback.tenant_id,
                feedback.doc_type.as_str(),
                serde_json::to_string(&feedback.headers)?,
                serde_json::to_string(&feedback.fields)?,
                feedback.feedback_type.as_str(),
                now()
            ],
        )?;
        Ok(())
    }

    fn increment(&self, key: &StatsKey, correct: bool) -> Result<()> {
        let conn = self.lock()?;
        let correct = i64::from(correct);
        conn.execute(
            "INSERT INTO mapping_stats (tenant_id, doc_type, normalized_header, canonical_field, correct_count, total_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(tenant_id, doc_type, normalized_header, canonical_field) DO UPDATE SET
               correct_count = correct_count + excluded.correct_count,
               total_count = total_count + 1,
               updated_at = excluded.updated_at",
            params![
                key.tenant_id,
                key.doc_type.as_str(),
                key.header,
                key.canonical_field,
                correct,
                now()
            ],
        )?;
        Ok(())
    }

    fn get(&self, key: &StatsKey) -> Result<Option<FieldStats>> {
        let conn = self.lock()?;
        let stats = conn
            .query_row(
                "SELECT correct_count, total_count FROM mapping_stats
                 WHERE tenant_id = ?1 AND doc_type = ?2 AND normalized_header = ?3 AND canonical_field = ?4",
                params![key.tenant_id, key.doc_type.as_str(), key.header, key.canonical_field],
                |r| {
                    Ok(FieldStats {
                        correct_count: r.get::<_, i64>(0)?.max(0) as u64,
                        total_count: r.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    fn candidates(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        header: &str,
    ) -> Result<Vec<(String, FieldStats)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT canonical_field, correct_count, total_count FROM mapping_stats
             WHERE tenant_id = ?1 AND doc_type = ?2 AND normalized_header = ?3
             ORDER BY canonical_field",
        )?;
        let rows = stmt.query_map(params![tenant_id, doc_type.as_str(), header], |r| {
            Ok((
                r.get::<_, String>(0)?,
                FieldStats {
                    correct_count: r.get::<_, i64>(1)?.max(0) as u64,
                    total_count: r.get::<_, i64>(2)?.max(0) as u64,
                },
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeedbackType, FieldFeedback};
    use crate::services::learner::MappingLearner;
    use serde_json::json;
    use std::sync::Arc;

    fn new_item(idx: i64, key: &str) -> NewImportItem {
        let mut raw = serde_json::Map::new();
        raw.insert("SKU".into(), json!(format!("A-{}", idx)));
        NewImportItem {
            idx,
            raw: raw.clone(),
            normalized: raw,
            canonical_doc: None,
            status: ItemStatus::Pending,
            errors: vec![],
            idempotency_key: key.to_string(),
            dedupe_hash: format!("hash-{}", idx),
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pipeline.db");
        drop(Db::new(path.clone()).unwrap());
        let db = Db::new(path).unwrap();
        let version: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn items_are_tenant_scoped_and_deduplicated_by_key() {
        let db = Db::open_in_memory().unwrap();
        let batch = db.create_batch("t1", "products.csv", Some("d1"), None).unwrap();
        let created = db
            .insert_items("t1", batch, &[new_item(0, "k0"), new_item(1, "k1")])
            .unwrap();
        assert_eq!(created, 2);
        // Replaying the same chunk creates nothing.
        let again = db
            .insert_items("t1", batch, &[new_item(0, "k0"), new_item(1, "k1")])
            .unwrap();
        assert_eq!(again, 0);

        assert_eq!(db.list_items("t1", batch, None).unwrap().len(), 2);
        assert!(db.list_items("t2", batch, None).unwrap().is_empty());
        assert!(matches!(db.get_batch("t2", batch), Err(PipelineError::NotFound(_))));
        let counts = db.count_items_by_status("t1", batch).unwrap();
        assert_eq!(counts.get("PENDING"), Some(&2));
    }

    #[test]
    fn item_errors_are_appended() {
        let db = Db::open_in_memory().unwrap();
        let batch = db.create_batch("t1", "f.csv", None, None).unwrap();
        db.insert_items("t1", batch, &[new_item(0, "k0")]).unwrap();
        let id = db.list_items("t1", batch, None).unwrap()[0].id;
        db.update_item_status("t1", id, ItemStatus::ErrorPromotion, &[ItemError::new("promotion", "first")])
            .unwrap();
        db.update_item_status("t1", id, ItemStatus::ErrorPromotion, &[ItemError::new("promotion", "second")])
            .unwrap();
        let item = db.get_item("t1", id).unwrap();
        assert_eq!(item.status, ItemStatus::ErrorPromotion);
        let messages: Vec<&str> = item.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[test]
    fn batch_summary_merges() {
        let db = Db::open_in_memory().unwrap();
        let batch = db.create_batch("t1", "f.csv", None, Some("product")).unwrap();
        db.merge_batch_summary("t1", batch, &json!({"processed": 3})).unwrap();
        db.merge_batch_summary("t1", batch, &json!({"promoted": 2})).unwrap();
        let b = db.get_batch("t1", batch).unwrap();
        assert_eq!(b.summary, Some(json!({"processed": 3, "promoted": 2})));
        assert_eq!(b.doc_type.as_deref(), Some("product"));
    }

    #[test]
    fn destination_insert_is_idempotent_per_source_key() {
        let db = Db::open_in_memory().unwrap();
        let cols = vec![
            ("name", SqlValue::Text("Widget".into())),
            ("price", SqlValue::Real(2.5)),
        ];
        let a = db.insert_destination("products", "t1", "src-1", &cols, &json!({})).unwrap();
        let b = db.insert_destination("products", "t1", "src-1", &cols, &json!({})).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.count_destination_rows("products", "t1").unwrap(), 1);

        let negative = vec![
            ("name", SqlValue::Text("Broken".into())),
            ("price", SqlValue::Real(-1.0)),
        ];
        assert!(matches!(
            db.insert_destination("products", "t1", "src-2", &negative, &json!({})),
            Err(PipelineError::Database(_))
        ));
    }

    #[test]
    fn learner_over_sqlite_store() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let learner = MappingLearner::new(db.clone());
        for _ in 0..5 {
            learner
                .record_feedback(&MappingFeedback {
                    tenant_id: "t1".into(),
                    doc_type: DocType::Expense,
                    headers: vec!["Importe".into()],
                    fields: vec![FieldFeedback {
                        header: "Importe".into(),
                        suggested: Some("expense.tax".into()),
                        corrected: Some("expense.amount".into()),
                    }],
                    feedback_type: FeedbackType::Corrected,
                })
                .unwrap();
        }
        let (target, acc) = learner
            .learned_target("t1", DocType::Expense, "importe")
            .unwrap()
            .unwrap();
        assert_eq!(target, "expense.amount");
        assert!((acc - 1.0).abs() < f64::EPSILON);
        assert!(learner.learned_target("t2", DocType::Expense, "Importe").unwrap().is_none());
    }

    #[test]
    fn classification_feedback_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.record_classification_feedback(&ClassificationFeedback {
            tenant_id: "t1".into(),
            headers: vec!["A".into()],
            predicted: None,
            actual: DocType::Product,
        })
        .unwrap();
        let all = db.classification_feedback().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].actual, DocType::Product);
    }
}
