#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite-backed invoice store: durable, transactional persistence of
//! invoice records and their append-only audit trail.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use invoice_ledger_core::{
    amount_from_stored, amount_to_stored, format_rfc3339, now_utc, parse_rfc3339_utc,
    AuditEventType, AuditLogEntry, InvoiceDraft, InvoiceFilter, InvoiceId, InvoiceRecord,
    InvoiceStatus, LedgerError, LedgerResult, UpsertOutcome, UpsertResult,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::{info, warn};
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const OP_UPSERT: &str = "upsert";
const OP_TRANSITION: &str = "transition_status";
const OP_GET: &str = "get";
const OP_LIST: &str = "list";
const OP_AUDIT_TRAIL: &str = "audit_trail";

// Column list shared by every invoice SELECT so row parsing stays positional.
const INVOICE_COLUMNS: &str = "id, invoice_number, vendor_name, invoice_date, due_date, \
     total_amount, currency, po_number, status, raw_text, email_from, email_subject, \
     created_at, updated_at";

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS invoices (
  id VARCHAR(64) PRIMARY KEY,
  invoice_number VARCHAR(64) NOT NULL UNIQUE,
  vendor_name VARCHAR(256) NOT NULL,
  invoice_date TIMESTAMP NOT NULL,
  due_date TIMESTAMP,
  total_amount NUMERIC(15,2) NOT NULL,
  currency VARCHAR(3) NOT NULL DEFAULT 'USD',
  po_number VARCHAR(64),
  status VARCHAR(32) NOT NULL,
  raw_text TEXT,
  email_from VARCHAR(256),
  email_subject VARCHAR(512),
  created_at TIMESTAMP NOT NULL,
  updated_at TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_invoices_invoice_number
  ON invoices(invoice_number);
CREATE INDEX IF NOT EXISTS idx_invoices_vendor_name
  ON invoices(vendor_name);
CREATE INDEX IF NOT EXISTS idx_invoices_status
  ON invoices(status);
CREATE INDEX IF NOT EXISTS idx_invoices_created_at
  ON invoices(created_at);

CREATE TABLE IF NOT EXISTS invoice_audit_log (
  id VARCHAR(64) PRIMARY KEY,
  invoice_number VARCHAR(64) NOT NULL,
  event_type VARCHAR(64) NOT NULL,
  event_data TEXT,
  created_at TIMESTAMP NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_invoice_audit_log_no_update
BEFORE UPDATE ON invoice_audit_log
BEGIN
  SELECT RAISE(FAIL, 'invoice_audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_invoice_audit_log_no_delete
BEFORE DELETE ON invoice_audit_log
BEGIN
  SELECT RAISE(FAIL, 'invoice_audit_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_invoice_audit_log_invoice_number
  ON invoice_audit_log(invoice_number);
CREATE INDEX IF NOT EXISTS idx_invoice_audit_log_created_at
  ON invoice_audit_log(created_at);
";

/// Connection settings for one store handle. No ambient singleton: callers
/// construct a handle from this (or a bare path) and pass it around.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Upper bound on any transactional wait; expiry surfaces as
    /// [`LedgerError::Transient`].
    pub busy_timeout: Duration,
}

impl StoreConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// The invoice store. Owns the `invoices` and `invoice_audit_log` tables
/// and their invariants; nothing else writes to either.
pub struct SqliteInvoiceStore {
    conn: Connection,
}

impl SqliteInvoiceStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(&StoreConfig::new(path))
    }

    pub fn open_with_config(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(&config.path).with_context(|| {
            format!(
                "failed to open sqlite database at {}",
                config.path.display()
            )
        })?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout.as_millis()
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Applies the ledger schema. Idempotent; safe to call on every open.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_rfc3339(now_utc()).context("failed to format migration timestamp")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    /// Insert-or-update keyed by `invoice_number`. The row write and its
    /// audit entry commit together or not at all.
    ///
    /// Re-delivery of an identical payload is a pure no-op: nothing is
    /// written, no audit entry is emitted, and the outcome reports
    /// [`UpsertOutcome::Unchanged`].
    pub fn upsert(&mut self, draft: &InvoiceDraft) -> LedgerResult<UpsertResult> {
        let number = draft.invoice_number.clone();

        let report = draft.validate();
        for warning in &report.warnings {
            warn!(invoice_number = %number, warning = %warning, "draft accepted with warning");
        }
        if !report.is_valid() {
            return Err(LedgerError::validation(
                OP_UPSERT,
                number,
                report.errors.join("; "),
            ));
        }

        let now = now_utc();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_error(OP_UPSERT, &number, &err))?;

        let existing = fetch_invoice(&tx, OP_UPSERT, &number)?;

        match existing {
            None => {
                let record = InvoiceRecord {
                    id: InvoiceId::new(),
                    invoice_number: draft.invoice_number.clone(),
                    vendor_name: draft.vendor_name.clone(),
                    invoice_date: draft.invoice_date,
                    due_date: draft.due_date,
                    total_amount: draft.total_amount,
                    currency: draft.currency.clone(),
                    po_number: draft.po_number.clone(),
                    status: InvoiceStatus::Pending,
                    raw_text: draft.raw_text.clone(),
                    email_from: draft.email_from.clone(),
                    email_subject: draft.email_subject.clone(),
                    created_at: now,
                    updated_at: now,
                };

                insert_invoice(&tx, OP_UPSERT, &record)?;

                let snapshot = record
                    .created_snapshot()
                    .map_err(|err| LedgerError::storage(OP_UPSERT, &number, err.to_string()))?;
                insert_audit_entry(&tx, OP_UPSERT, &number, AuditEventType::Created, &snapshot, now)?;

                tx.commit()
                    .map_err(|err| map_sqlite_error(OP_UPSERT, &number, &err))?;

                info!(invoice_number = %number, id = %record.id, "inserted invoice");
                Ok(UpsertResult {
                    outcome: UpsertOutcome::Created,
                    changed_fields: Vec::new(),
                    record,
                })
            }
            Some(current) => {
                let diff = current
                    .diff_against(draft)
                    .map_err(|err| LedgerError::storage(OP_UPSERT, &number, err.to_string()))?;

                if diff.is_empty() {
                    tx.rollback()
                        .map_err(|err| map_sqlite_error(OP_UPSERT, &number, &err))?;
                    return Ok(UpsertResult {
                        outcome: UpsertOutcome::Unchanged,
                        changed_fields: Vec::new(),
                        record: current,
                    });
                }

                let changed_fields: Vec<String> = diff.keys().cloned().collect();

                let mut updated = current;
                updated.vendor_name = draft.vendor_name.clone();
                updated.invoice_date = draft.invoice_date;
                updated.due_date = draft.due_date;
                updated.total_amount = draft.total_amount;
                updated.currency = draft.currency.clone();
                updated.po_number = draft.po_number.clone();
                if updated.raw_text.is_none() {
                    updated.raw_text = draft.raw_text.clone();
                }
                updated.updated_at = now;

                update_invoice(&tx, OP_UPSERT, &updated)?;
                insert_audit_entry(
                    &tx,
                    OP_UPSERT,
                    &number,
                    AuditEventType::Updated,
                    &Value::Object(diff),
                    now,
                )?;

                tx.commit()
                    .map_err(|err| map_sqlite_error(OP_UPSERT, &number, &err))?;

                info!(
                    invoice_number = %number,
                    changed = changed_fields.join(","),
                    "updated invoice"
                );
                Ok(UpsertResult {
                    outcome: UpsertOutcome::Updated,
                    changed_fields,
                    record: updated,
                })
            }
        }
    }

    /// Moves an invoice along the lifecycle state machine, recording a
    /// `status_changed` audit entry in the same transaction.
    pub fn transition_status(
        &mut self,
        invoice_number: &str,
        new_status: InvoiceStatus,
    ) -> LedgerResult<InvoiceRecord> {
        let now = now_utc();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_error(OP_TRANSITION, invoice_number, &err))?;

        let Some(current) = fetch_invoice(&tx, OP_TRANSITION, invoice_number)? else {
            return Err(LedgerError::not_found(OP_TRANSITION, invoice_number));
        };

        if !current.status.can_transition_to(new_status) {
            return Err(LedgerError::invalid_transition(
                OP_TRANSITION,
                invoice_number,
                current.status,
                new_status,
            ));
        }

        let updated_at = format_rfc3339(now)
            .map_err(|err| LedgerError::storage(OP_TRANSITION, invoice_number, err.to_string()))?;
        tx.execute(
            "UPDATE invoices SET status = ?1, updated_at = ?2 WHERE invoice_number = ?3",
            params![new_status.as_str(), updated_at, invoice_number],
        )
        .map_err(|err| map_sqlite_error(OP_TRANSITION, invoice_number, &err))?;

        let mut event_data = serde_json::Map::new();
        event_data.insert(
            "from".to_string(),
            Value::String(current.status.as_str().to_string()),
        );
        event_data.insert(
            "to".to_string(),
            Value::String(new_status.as_str().to_string()),
        );
        insert_audit_entry(
            &tx,
            OP_TRANSITION,
            invoice_number,
            AuditEventType::StatusChanged,
            &Value::Object(event_data),
            now,
        )?;

        tx.commit()
            .map_err(|err| map_sqlite_error(OP_TRANSITION, invoice_number, &err))?;

        info!(
            invoice_number = %invoice_number,
            from = current.status.as_str(),
            to = new_status.as_str(),
            "transitioned invoice status"
        );

        let mut record = current;
        record.status = new_status;
        record.updated_at = now;
        Ok(record)
    }

    /// Current record for a business key.
    pub fn get(&self, invoice_number: &str) -> LedgerResult<InvoiceRecord> {
        fetch_invoice(&self.conn, OP_GET, invoice_number)?
            .ok_or_else(|| LedgerError::not_found(OP_GET, invoice_number))
    }

    /// Records matching `filter`, ordered by `created_at` ASC (`id` ASC
    /// tiebreak). Restartable: pass the [`InvoiceRecord::cursor`] of the
    /// last record seen as `filter.after` to resume the scan.
    pub fn list(&self, filter: &InvoiceFilter) -> LedgerResult<Vec<InvoiceRecord>> {
        let mut sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices");
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            binds.push(status.as_str().to_string());
        }
        if let Some(vendor_name) = &filter.vendor_name {
            clauses.push("vendor_name = ?".to_string());
            binds.push(vendor_name.clone());
        }
        if let Some(from) = filter.invoice_date_from {
            clauses.push("invoice_date >= ?".to_string());
            binds.push(
                format_rfc3339(from)
                    .map_err(|err| LedgerError::storage(OP_LIST, "", err.to_string()))?,
            );
        }
        if let Some(to) = filter.invoice_date_to {
            clauses.push("invoice_date <= ?".to_string());
            binds.push(
                format_rfc3339(to)
                    .map_err(|err| LedgerError::storage(OP_LIST, "", err.to_string()))?,
            );
        }
        if let Some(after) = &filter.after {
            let created_at = format_rfc3339(after.created_at)
                .map_err(|err| LedgerError::storage(OP_LIST, "", err.to_string()))?;
            clauses.push("(created_at > ? OR (created_at = ? AND id > ?))".to_string());
            binds.push(created_at.clone());
            binds.push(created_at);
            binds.push(after.id.to_string());
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| map_sqlite_error(OP_LIST, "", &err))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(binds.iter()), parse_invoice_row)
            .map_err(|err| map_sqlite_error(OP_LIST, "", &err))?;

        collect_rows(OP_LIST, rows)
    }

    /// Audit entries for one business key, oldest first. Entries may
    /// reference invoices the store no longer holds; no existence check is
    /// performed.
    pub fn audit_trail(
        &self,
        invoice_number: &str,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<AuditLogEntry>> {
        let mut sql = "SELECT id, invoice_number, event_type, event_data, created_at
             FROM invoice_audit_log
             WHERE invoice_number = ?1
             ORDER BY created_at ASC, id ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&raw_limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| map_sqlite_error(OP_AUDIT_TRAIL, invoice_number, &err))?;
        let rows = stmt
            .query_map(params![invoice_number], parse_audit_row)
            .map_err(|err| map_sqlite_error(OP_AUDIT_TRAIL, invoice_number, &err))?;

        collect_rows(OP_AUDIT_TRAIL, rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn map_sqlite_error(
    operation: &'static str,
    invoice_number: &str,
    err: &rusqlite::Error,
) -> LedgerError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            LedgerError::transient(operation, invoice_number, err.to_string())
        }
        Some(ErrorCode::ConstraintViolation) => {
            LedgerError::conflict(operation, invoice_number, err.to_string())
        }
        _ => LedgerError::storage(operation, invoice_number, err.to_string()),
    }
}

fn fetch_invoice(
    conn: &Connection,
    operation: &'static str,
    invoice_number: &str,
) -> LedgerResult<Option<InvoiceRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_number = ?1"
        ))
        .map_err(|err| map_sqlite_error(operation, invoice_number, &err))?;

    stmt.query_row(params![invoice_number], parse_invoice_row)
        .optional()
        .map_err(|err| map_sqlite_error(operation, invoice_number, &err))
}

fn insert_invoice(
    conn: &Connection,
    operation: &'static str,
    record: &InvoiceRecord,
) -> LedgerResult<()> {
    let number = record.invoice_number.as_str();
    let codec = |err: invoice_ledger_core::CodecError| {
        LedgerError::storage(operation, number, err.to_string())
    };

    conn.execute(
        "INSERT INTO invoices(
            id, invoice_number, vendor_name, invoice_date, due_date,
            total_amount, currency, po_number, status, raw_text,
            email_from, email_subject, created_at, updated_at
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14
         )",
        params![
            record.id.to_string(),
            record.invoice_number,
            record.vendor_name,
            format_rfc3339(record.invoice_date).map_err(codec)?,
            record.due_date.map(format_rfc3339).transpose().map_err(codec)?,
            amount_to_stored(record.total_amount).map_err(codec)?,
            record.currency,
            record.po_number,
            record.status.as_str(),
            record.raw_text,
            record.email_from,
            record.email_subject,
            format_rfc3339(record.created_at).map_err(codec)?,
            format_rfc3339(record.updated_at).map_err(codec)?,
        ],
    )
    .map_err(|err| map_sqlite_error(operation, number, &err))?;

    Ok(())
}

fn update_invoice(
    conn: &Connection,
    operation: &'static str,
    record: &InvoiceRecord,
) -> LedgerResult<()> {
    let number = record.invoice_number.as_str();
    let codec = |err: invoice_ledger_core::CodecError| {
        LedgerError::storage(operation, number, err.to_string())
    };

    conn.execute(
        "UPDATE invoices SET
            vendor_name = ?1,
            invoice_date = ?2,
            due_date = ?3,
            total_amount = ?4,
            currency = ?5,
            po_number = ?6,
            raw_text = ?7,
            updated_at = ?8
         WHERE invoice_number = ?9",
        params![
            record.vendor_name,
            format_rfc3339(record.invoice_date).map_err(codec)?,
            record.due_date.map(format_rfc3339).transpose().map_err(codec)?,
            amount_to_stored(record.total_amount).map_err(codec)?,
            record.currency,
            record.po_number,
            record.raw_text,
            format_rfc3339(record.updated_at).map_err(codec)?,
            number,
        ],
    )
    .map_err(|err| map_sqlite_error(operation, number, &err))?;

    Ok(())
}

fn insert_audit_entry(
    conn: &Connection,
    operation: &'static str,
    invoice_number: &str,
    event_type: AuditEventType,
    event_data: &Value,
    created_at: time::OffsetDateTime,
) -> LedgerResult<()> {
    let serialized = serde_json::to_string(event_data)
        .map_err(|err| LedgerError::storage(operation, invoice_number, err.to_string()))?;
    let created = format_rfc3339(created_at)
        .map_err(|err| LedgerError::storage(operation, invoice_number, err.to_string()))?;

    conn.execute(
        "INSERT INTO invoice_audit_log(id, invoice_number, event_type, event_data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Ulid::new().to_string(),
            invoice_number,
            event_type.as_str(),
            serialized,
            created,
        ],
    )
    .map_err(|err| map_sqlite_error(operation, invoice_number, &err))?;

    Ok(())
}

fn parse_invoice_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvoiceRecord> {
    let id_raw: String = row.get(0)?;
    let invoice_date_raw: String = row.get(3)?;
    let due_date_raw: Option<String> = row.get(4)?;
    let total_amount_raw: f64 = row.get(5)?;
    let status_raw: String = row.get(8)?;
    let created_at_raw: String = row.get(12)?;
    let updated_at_raw: String = row.get(13)?;

    let id = Ulid::from_string(&id_raw).map_err(|_| {
        invalid_column(0, rusqlite::types::Type::Text, format!("invalid ULID: {id_raw}"))
    })?;

    let status = InvoiceStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(
            8,
            rusqlite::types::Type::Text,
            format!("invalid status: {status_raw}"),
        )
    })?;

    let due_date = due_date_raw
        .as_deref()
        .map(|raw| parse_rfc3339_utc(raw).map_err(|err| to_sql_error(4, &err)))
        .transpose()?;

    Ok(InvoiceRecord {
        id: InvoiceId(id),
        invoice_number: row.get(1)?,
        vendor_name: row.get(2)?,
        invoice_date: parse_rfc3339_utc(&invoice_date_raw).map_err(|err| to_sql_error(3, &err))?,
        due_date,
        total_amount: amount_from_stored(total_amount_raw).map_err(|err| to_sql_error(5, &err))?,
        currency: row.get(6)?,
        po_number: row.get(7)?,
        status,
        raw_text: row.get(9)?,
        email_from: row.get(10)?,
        email_subject: row.get(11)?,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(12, &err))?,
        updated_at: parse_rfc3339_utc(&updated_at_raw).map_err(|err| to_sql_error(13, &err))?,
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let id_raw: String = row.get(0)?;
    let event_type_raw: String = row.get(2)?;
    let event_data_raw: Option<String> = row.get(3)?;
    let created_at_raw: String = row.get(4)?;

    let id = Ulid::from_string(&id_raw).map_err(|_| {
        invalid_column(0, rusqlite::types::Type::Text, format!("invalid ULID: {id_raw}"))
    })?;

    let event_type = AuditEventType::parse(&event_type_raw).ok_or_else(|| {
        invalid_column(
            2,
            rusqlite::types::Type::Text,
            format!("invalid event_type: {event_type_raw}"),
        )
    })?;

    let event_data = match event_data_raw.as_deref() {
        Some(raw) => serde_json::from_str(raw).map_err(|err| {
            invalid_column(
                3,
                rusqlite::types::Type::Text,
                format!("invalid event_data: {err}"),
            )
        })?,
        None => Value::Null,
    };

    Ok(AuditLogEntry {
        id,
        invoice_number: row.get(1)?,
        event_type,
        event_data,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(4, &err))?,
    })
}

fn invalid_column(index: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(index: usize, err: &invoice_ledger_core::CodecError) -> rusqlite::Error {
    invalid_column(index, rusqlite::types::Type::Text, err.to_string())
}

fn collect_rows<T>(
    operation: &'static str,
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> LedgerResult<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| map_sqlite_error(operation, "", &err))?);
    }
    Ok(values)
}
