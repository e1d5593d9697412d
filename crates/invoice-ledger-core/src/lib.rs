//! Domain model for the invoice ledger: record and draft types, the status
//! lifecycle, validation, audit events, and the error taxonomy shared by
//! every store backend.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Result alias for store-facing operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Error taxonomy for store operations. Every variant names the operation
/// and the offending `invoice_number` so callers can route failures without
/// string matching.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed input; the caller must fix the data before retrying.
    #[error("{operation} rejected for invoice {invoice_number}: {reason}")]
    Validation {
        operation: &'static str,
        invoice_number: String,
        reason: String,
    },

    /// Unknown business key.
    #[error("{operation} failed: invoice {invoice_number} not found")]
    NotFound {
        operation: &'static str,
        invoice_number: String,
    },

    /// Status change not permitted by the lifecycle state machine.
    #[error(
        "{operation} rejected for invoice {invoice_number}: \
         {from} -> {to} is not a valid transition"
    )]
    InvalidTransition {
        operation: &'static str,
        invoice_number: String,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    /// Bounded lock or statement timeout; safe to retry with backoff.
    #[error("{operation} timed out for invoice {invoice_number}: {reason}")]
    Transient {
        operation: &'static str,
        invoice_number: String,
        reason: String,
    },

    /// Uniqueness violation on a racing insert; retry as an update.
    #[error("{operation} conflicted for invoice {invoice_number}: {reason}")]
    Conflict {
        operation: &'static str,
        invoice_number: String,
        reason: String,
    },

    /// Non-retryable storage or decode failure.
    #[error("{operation} failed for invoice {invoice_number}: {reason}")]
    Storage {
        operation: &'static str,
        invoice_number: String,
        reason: String,
    },
}

impl LedgerError {
    pub fn validation(
        operation: &'static str,
        invoice_number: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            operation,
            invoice_number: invoice_number.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(operation: &'static str, invoice_number: impl Into<String>) -> Self {
        Self::NotFound {
            operation,
            invoice_number: invoice_number.into(),
        }
    }

    pub fn invalid_transition(
        operation: &'static str,
        invoice_number: impl Into<String>,
        from: InvoiceStatus,
        to: InvoiceStatus,
    ) -> Self {
        Self::InvalidTransition {
            operation,
            invoice_number: invoice_number.into(),
            from,
            to,
        }
    }

    pub fn transient(
        operation: &'static str,
        invoice_number: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Transient {
            operation,
            invoice_number: invoice_number.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(
        operation: &'static str,
        invoice_number: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            operation,
            invoice_number: invoice_number.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(
        operation: &'static str,
        invoice_number: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Storage {
            operation,
            invoice_number: invoice_number.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure is eligible for external retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Validation { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::InvalidTransition { operation, .. }
            | Self::Transient { operation, .. }
            | Self::Conflict { operation, .. }
            | Self::Storage { operation, .. } => *operation,
        }
    }

    #[must_use]
    pub fn invoice_number(&self) -> &str {
        match self {
            Self::Validation { invoice_number, .. }
            | Self::NotFound { invoice_number, .. }
            | Self::InvalidTransition { invoice_number, .. }
            | Self::Transient { invoice_number, .. }
            | Self::Conflict { invoice_number, .. }
            | Self::Storage { invoice_number, .. } => invoice_number,
        }
    }
}

/// Errors from pure codec helpers (timestamps, stored amounts). Store
/// backends wrap these into [`LedgerError::Storage`] with operation context.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid RFC3339 timestamp: {0}")]
    Timestamp(String),
    #[error("invalid stored amount: {0}")]
    Amount(String),
}

/// Opaque stable identifier of a stored invoice row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub Ulid);

impl InvoiceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for InvoiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InvoiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Invoice lifecycle status.
///
/// `pending` is the only initial state; `paid` and `void` are terminal, and
/// `rejected` admits only the `void` escape hatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Approved,
    Rejected,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Approved,
        Self::Rejected,
        Self::Paid,
        Self::Void,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Paid => "paid",
            Self::Void => "void",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "paid" => Some(Self::Paid),
            "void" => Some(Self::Void),
            _ => None,
        }
    }

    /// Targets reachable from this status. Self-transitions are never
    /// permitted; idempotent re-delivery goes through `upsert` instead.
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Approved, Self::Rejected, Self::Void],
            Self::Approved => &[Self::Paid, Self::Rejected, Self::Void],
            Self::Rejected => &[Self::Void],
            Self::Paid | Self::Void => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_transitions().contains(&next)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

impl Display for InvoiceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an accepted mutation recorded in the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Created,
    Updated,
    StatusChanged,
}

impl AuditEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::StatusChanged => "status_changed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "status_changed" => Some(Self::StatusChanged),
            _ => None,
        }
    }
}

/// A stored invoice row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoiceRecord {
    pub id: InvoiceId,
    pub invoice_number: String,
    pub vendor_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub invoice_date: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub total_amount: Decimal,
    pub currency: String,
    pub po_number: Option<String>,
    pub status: InvoiceStatus,
    pub raw_text: Option<String>,
    pub email_from: Option<String>,
    pub email_subject: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl InvoiceRecord {
    /// Resume point for restartable listing: the position of this record in
    /// `created_at` (then `id`) order.
    #[must_use]
    pub fn cursor(&self) -> ListCursor {
        ListCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }

    /// Per-field `{from, to}` diff of the mutable fields against an incoming
    /// draft. An empty map means the upsert is a pure no-op.
    ///
    /// `raw_text` is set-once: it appears in the diff only when the stored
    /// value is absent and the draft carries one. Provenance fields never
    /// appear.
    ///
    /// # Errors
    /// Returns [`CodecError::Timestamp`] when a date cannot be rendered as
    /// RFC3339.
    pub fn diff_against(&self, draft: &InvoiceDraft) -> Result<Map<String, Value>, CodecError> {
        let mut diff = Map::new();

        if self.vendor_name != draft.vendor_name {
            diff.insert(
                "vendor_name".to_string(),
                change(
                    Value::String(self.vendor_name.clone()),
                    Value::String(draft.vendor_name.clone()),
                ),
            );
        }

        if self.invoice_date != draft.invoice_date {
            diff.insert(
                "invoice_date".to_string(),
                change(
                    Value::String(format_rfc3339(self.invoice_date)?),
                    Value::String(format_rfc3339(draft.invoice_date)?),
                ),
            );
        }

        if self.due_date != draft.due_date {
            diff.insert(
                "due_date".to_string(),
                change(
                    optional_timestamp(self.due_date)?,
                    optional_timestamp(draft.due_date)?,
                ),
            );
        }

        if self.total_amount != draft.total_amount {
            diff.insert(
                "total_amount".to_string(),
                change(
                    Value::String(self.total_amount.to_string()),
                    Value::String(draft.total_amount.to_string()),
                ),
            );
        }

        if self.currency != draft.currency {
            diff.insert(
                "currency".to_string(),
                change(
                    Value::String(self.currency.clone()),
                    Value::String(draft.currency.clone()),
                ),
            );
        }

        if self.po_number != draft.po_number {
            diff.insert(
                "po_number".to_string(),
                change(
                    optional_string(self.po_number.as_deref()),
                    optional_string(draft.po_number.as_deref()),
                ),
            );
        }

        if let (None, Some(raw_text)) = (&self.raw_text, draft.raw_text.as_deref()) {
            diff.insert(
                "raw_text".to_string(),
                change(Value::Null, Value::String(raw_text.to_string())),
            );
        }

        Ok(diff)
    }

    /// JSON snapshot recorded with the `created` audit entry.
    ///
    /// # Errors
    /// Returns [`CodecError::Timestamp`] when a date cannot be rendered as
    /// RFC3339.
    pub fn created_snapshot(&self) -> Result<Value, CodecError> {
        let mut snapshot = Map::new();
        snapshot.insert(
            "vendor_name".to_string(),
            Value::String(self.vendor_name.clone()),
        );
        snapshot.insert(
            "invoice_date".to_string(),
            Value::String(format_rfc3339(self.invoice_date)?),
        );
        snapshot.insert("due_date".to_string(), optional_timestamp(self.due_date)?);
        snapshot.insert(
            "total_amount".to_string(),
            Value::String(self.total_amount.to_string()),
        );
        snapshot.insert("currency".to_string(), Value::String(self.currency.clone()));
        snapshot.insert(
            "po_number".to_string(),
            optional_string(self.po_number.as_deref()),
        );
        snapshot.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        Ok(Value::Object(snapshot))
    }
}

fn change(from: Value, to: Value) -> Value {
    let mut entry = Map::new();
    entry.insert("from".to_string(), from);
    entry.insert("to".to_string(), to);
    Value::Object(entry)
}

fn optional_string(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |inner| Value::String(inner.to_string()))
}

fn optional_timestamp(value: Option<OffsetDateTime>) -> Result<Value, CodecError> {
    match value {
        Some(inner) => Ok(Value::String(format_rfc3339(inner)?)),
        None => Ok(Value::Null),
    }
}

/// Candidate invoice payload delivered by the upstream extraction
/// collaborator. The store owns `id`, `status`, `created_at`, `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoiceDraft {
    pub invoice_number: String,
    pub vendor_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub invoice_date: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub total_amount: Decimal,
    pub currency: String,
    pub po_number: Option<String>,
    pub raw_text: Option<String>,
    pub email_from: Option<String>,
    pub email_subject: Option<String>,
}

/// Largest value NUMERIC(15,2) can hold is 9999999999999.99.
const MAX_TOTAL_AMOUNT_WHOLE: i64 = 10_000_000_000_000;

impl InvoiceDraft {
    /// Runs every business-rule check and accumulates the outcome instead of
    /// stopping at the first failure, so a rejection names everything wrong
    /// with the payload at once.
    #[must_use]
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.check_invoice_number(&mut report);
        self.check_vendor_name(&mut report);
        self.check_total_amount(&mut report);
        self.check_currency(&mut report);
        self.check_optional_lengths(&mut report);
        self.check_dates(&mut report);

        report
    }

    fn check_invoice_number(&self, report: &mut ValidationReport) {
        if self.invoice_number.trim().is_empty() {
            report.add_error("invoice_number is empty");
            return;
        }
        if self.invoice_number.len() > 64 {
            report.add_error("invoice_number exceeds 64 characters");
        }
        let well_formed = self
            .invoice_number
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '/' | '_'));
        if !well_formed {
            report.add_error(format!(
                "invoice_number {} contains characters outside [A-Za-z0-9-/_]",
                self.invoice_number
            ));
        }
    }

    fn check_vendor_name(&self, report: &mut ValidationReport) {
        if self.vendor_name.trim().is_empty() {
            report.add_error("vendor_name is empty");
        } else if self.vendor_name.len() > 256 {
            report.add_error("vendor_name exceeds 256 characters");
        }
    }

    fn check_total_amount(&self, report: &mut ValidationReport) {
        if self.total_amount.is_sign_negative() && !self.total_amount.is_zero() {
            report.add_error(format!(
                "total_amount {} is negative",
                self.total_amount
            ));
        }
        if self.total_amount.round_dp(2) != self.total_amount {
            report.add_error(format!(
                "total_amount {} has more than two decimal places",
                self.total_amount
            ));
        }
        if self.total_amount >= Decimal::from(MAX_TOTAL_AMOUNT_WHOLE) {
            report.add_error(format!(
                "total_amount {} does not fit NUMERIC(15,2)",
                self.total_amount
            ));
        }
    }

    fn check_currency(&self, report: &mut ValidationReport) {
        let recognized = self.currency.len() == 3
            && self.currency.chars().all(|ch| ch.is_ascii_uppercase());
        if !recognized {
            report.add_error(format!(
                "currency {:?} is not a 3-letter uppercase code",
                self.currency
            ));
        }
    }

    fn check_optional_lengths(&self, report: &mut ValidationReport) {
        if self.po_number.as_deref().is_some_and(|value| value.len() > 64) {
            report.add_error("po_number exceeds 64 characters");
        }
        if self.email_from.as_deref().is_some_and(|value| value.len() > 256) {
            report.add_error("email_from exceeds 256 characters");
        }
        if self
            .email_subject
            .as_deref()
            .is_some_and(|value| value.len() > 512)
        {
            report.add_error("email_subject exceeds 512 characters");
        }
    }

    fn check_dates(&self, report: &mut ValidationReport) {
        if let Some(due_date) = self.due_date {
            if due_date < self.invoice_date {
                report.add_warning("due_date is before invoice_date");
            }
        }
        if self.invoice_date > now_utc() {
            report.add_warning("invoice_date is in the future");
        }
    }
}

/// Accumulated validation outcome: errors reject the payload, warnings are
/// surfaced (logged) but never block ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One immutable audit record of an accepted mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub id: Ulid,
    pub invoice_number: String,
    pub event_type: AuditEventType,
    pub event_data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Optional narrowing criteria for `list`. All fields compose with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub vendor_name: Option<String>,
    pub invoice_date_from: Option<OffsetDateTime>,
    pub invoice_date_to: Option<OffsetDateTime>,
    /// Resume strictly after this position (exclusive).
    pub after: Option<ListCursor>,
    pub limit: Option<usize>,
}

/// Keyset position in the `created_at` ASC, `id` ASC listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCursor {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub id: InvoiceId,
}

/// What an accepted `upsert` did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// The draft matched the stored row field for field; nothing was written
    /// and no audit entry was emitted.
    Unchanged,
}

impl UpsertOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of an accepted `upsert`: the committed row plus what happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertResult {
    pub outcome: UpsertOutcome,
    pub changed_fields: Vec<String>,
    pub record: InvoiceRecord,
}

/// Exponential-backoff policy for `Transient` failures. Every other error
/// class is returned on first occurrence; the store itself never retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-based), capped at
    /// `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base_delay.mul_f64(self.multiplier.powi(exponent));
        scaled.min(self.max_delay)
    }

    /// Runs `op`, retrying on [`LedgerError::Transient`] up to
    /// `max_attempts` total attempts.
    ///
    /// # Errors
    /// Returns the last error once attempts are exhausted, or immediately
    /// for any non-retryable error.
    pub fn run<T>(&self, mut op: impl FnMut() -> LedgerResult<T>) -> LedgerResult<T> {
        let mut attempt = 1_u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    std::thread::sleep(self.delay_for(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Fixed-width RFC3339 form used everywhere a timestamp is persisted or
/// compared: six subsecond digits keep lexicographic order identical to
/// chronological order.
const STORAGE_TIMESTAMP: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );

/// Parses an RFC3339 timestamp, insists on the UTC offset, and truncates to
/// microsecond precision (the ledger's storage precision).
///
/// # Errors
/// Returns [`CodecError::Timestamp`] for malformed input or a non-Z offset.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CodecError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CodecError::Timestamp(format!("{value}: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CodecError::Timestamp(format!(
            "{value}: timestamp MUST use UTC offset Z"
        )));
    }

    Ok(truncate_to_micros(parsed))
}

/// Formats a timestamp in the fixed-width UTC storage form.
///
/// # Errors
/// Returns [`CodecError::Timestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CodecError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(STORAGE_TIMESTAMP)
        .map_err(|err| CodecError::Timestamp(err.to_string()))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_micros(OffsetDateTime::now_utc().to_offset(UtcOffset::UTC))
}

fn truncate_to_micros(value: OffsetDateTime) -> OffsetDateTime {
    let micros_only = value.nanosecond() / 1_000 * 1_000;
    value.replace_nanosecond(micros_only).unwrap_or(value)
}

/// Reconstructs a NUMERIC(15,2) amount read back from storage as a float,
/// canonicalized to exactly two decimal places. Exact for every value that
/// passes draft validation (scale <= 2, fewer than 14 integer digits).
///
/// # Errors
/// Returns [`CodecError::Amount`] for NaN/infinite values.
pub fn amount_from_stored(raw: f64) -> Result<Decimal, CodecError> {
    let mut value = Decimal::from_f64_retain(raw)
        .ok_or_else(|| CodecError::Amount(format!("{raw} is not a finite decimal")))?
        .round_dp(2);
    value.rescale(2);
    Ok(value)
}

/// Converts an amount to the float representation handed to storage.
///
/// # Errors
/// Returns [`CodecError::Amount`] when the value cannot be represented.
pub fn amount_to_stored(value: Decimal) -> Result<f64, CodecError> {
    value
        .to_f64()
        .ok_or_else(|| CodecError::Amount(format!("{value} cannot be stored as NUMERIC")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    fn fixture_timestamp() -> OffsetDateTime {
        must_ok(parse_rfc3339_utc("2026-03-14T09:30:00Z"))
    }

    fn fixture_draft() -> InvoiceDraft {
        InvoiceDraft {
            invoice_number: "INV-1001".to_string(),
            vendor_name: "Acme Corp".to_string(),
            invoice_date: fixture_timestamp(),
            due_date: Some(must_ok(parse_rfc3339_utc("2026-04-14T00:00:00Z"))),
            total_amount: Decimal::new(125_000, 2),
            currency: "USD".to_string(),
            po_number: Some("PO-2026-001".to_string()),
            raw_text: Some("Invoice INV-1001 from Acme Corp".to_string()),
            email_from: Some("billing@acme.example".to_string()),
            email_subject: Some("Invoice INV-1001".to_string()),
        }
    }

    fn fixture_record() -> InvoiceRecord {
        let draft = fixture_draft();
        let now = fixture_timestamp();
        InvoiceRecord {
            id: InvoiceId::new(),
            invoice_number: draft.invoice_number,
            vendor_name: draft.vendor_name,
            invoice_date: draft.invoice_date,
            due_date: draft.due_date,
            total_amount: draft.total_amount,
            currency: draft.currency,
            po_number: draft.po_number,
            status: InvoiceStatus::Pending,
            raw_text: draft.raw_text,
            email_from: draft.email_from,
            email_subject: draft.email_subject,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_round_trips_through_string_form() {
        for status in InvoiceStatus::ALL {
            assert_eq!(InvoiceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InvoiceStatus::parse("stored"), None);
    }

    #[test]
    fn state_machine_accepts_only_lifecycle_edges() {
        let allowed = |from: InvoiceStatus, to: InvoiceStatus| -> bool {
            use InvoiceStatus::{Approved, Paid, Pending, Rejected, Void};
            matches!(
                (from, to),
                (Pending, Approved | Rejected | Void)
                    | (Approved, Paid | Rejected | Void)
                    | (Rejected, Void)
            )
        };

        for from in InvoiceStatus::ALL {
            for to in InvoiceStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed(from, to),
                    "transition {from} -> {to} disagrees with the lifecycle"
                );
            }
        }
    }

    #[test]
    fn self_transitions_are_rejected() {
        for status in InvoiceStatus::ALL {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn paid_and_void_are_terminal() {
        assert!(InvoiceStatus::Paid.is_terminal());
        assert!(InvoiceStatus::Void.is_terminal());
        assert!(!InvoiceStatus::Pending.is_terminal());
        assert!(!InvoiceStatus::Approved.is_terminal());
        assert!(!InvoiceStatus::Rejected.is_terminal());
    }

    #[test]
    fn audit_event_type_round_trips() {
        for event_type in [
            AuditEventType::Created,
            AuditEventType::Updated,
            AuditEventType::StatusChanged,
        ] {
            assert_eq!(AuditEventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(AuditEventType::parse("deleted"), None);
    }

    #[test]
    fn valid_draft_passes_validation() {
        let report = fixture_draft().validate();
        assert!(report.is_valid(), "unexpected errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn empty_invoice_number_is_rejected() {
        let mut draft = fixture_draft();
        draft.invoice_number = "   ".to_string();
        let report = draft.validate();
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|err| err.contains("invoice_number")));
    }

    #[test]
    fn invoice_number_charset_is_enforced() {
        let mut draft = fixture_draft();
        draft.invoice_number = "INV 1001!".to_string();
        assert!(!draft.validate().is_valid());
    }

    #[test]
    fn empty_vendor_name_is_rejected() {
        let mut draft = fixture_draft();
        draft.vendor_name = String::new();
        assert!(!draft.validate().is_valid());
    }

    #[test]
    fn negative_amount_is_rejected() {
        let mut draft = fixture_draft();
        draft.total_amount = Decimal::new(-500, 2);
        let report = draft.validate();
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|err| err.contains("negative")));
    }

    #[test]
    fn amount_with_sub_cent_precision_is_rejected() {
        let mut draft = fixture_draft();
        draft.total_amount = Decimal::new(123_456, 3);
        assert!(!draft.validate().is_valid());
    }

    #[test]
    fn amount_beyond_numeric_15_2_is_rejected() {
        let mut draft = fixture_draft();
        draft.total_amount = Decimal::from(MAX_TOTAL_AMOUNT_WHOLE);
        assert!(!draft.validate().is_valid());
    }

    #[test]
    fn zero_amount_is_accepted() {
        let mut draft = fixture_draft();
        draft.total_amount = Decimal::ZERO;
        assert!(draft.validate().is_valid());
    }

    #[test]
    fn lowercase_currency_is_rejected() {
        let mut draft = fixture_draft();
        draft.currency = "usd".to_string();
        assert!(!draft.validate().is_valid());
    }

    #[test]
    fn due_date_before_invoice_date_is_a_warning_not_an_error() {
        let mut draft = fixture_draft();
        draft.due_date = Some(must_ok(parse_rfc3339_utc("2026-01-01T00:00:00Z")));
        let report = draft.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|warn| warn.contains("due_date")));
    }

    #[test]
    fn identical_draft_yields_empty_diff() {
        let record = fixture_record();
        let draft = fixture_draft();
        let diff = must_ok(record.diff_against(&draft));
        assert!(diff.is_empty());
    }

    #[test]
    fn changed_vendor_and_amount_appear_in_diff() {
        let record = fixture_record();
        let mut draft = fixture_draft();
        draft.vendor_name = "Acme Corporation".to_string();
        draft.total_amount = Decimal::new(130_000, 2);

        let diff = must_ok(record.diff_against(&draft));
        assert_eq!(diff.len(), 2);
        assert_eq!(
            diff.get("vendor_name").and_then(|entry| entry.get("from")),
            Some(&Value::String("Acme Corp".to_string()))
        );
        assert_eq!(
            diff.get("total_amount").and_then(|entry| entry.get("to")),
            Some(&Value::String("1300.00".to_string()))
        );
    }

    #[test]
    fn raw_text_is_set_once() {
        let mut record = fixture_record();
        let mut draft = fixture_draft();

        // Stored text differs from the draft: immutable, so no diff entry.
        draft.raw_text = Some("something else entirely".to_string());
        let diff = must_ok(record.diff_against(&draft));
        assert!(!diff.contains_key("raw_text"));

        // Stored text absent: the draft may set it.
        record.raw_text = None;
        let diff = must_ok(record.diff_against(&draft));
        assert!(diff.contains_key("raw_text"));
    }

    #[test]
    fn provenance_fields_never_appear_in_diff() {
        let record = fixture_record();
        let mut draft = fixture_draft();
        draft.email_from = Some("other@acme.example".to_string());
        draft.email_subject = Some("RE: Invoice".to_string());
        let diff = must_ok(record.diff_against(&draft));
        assert!(diff.is_empty());
    }

    #[test]
    fn created_snapshot_names_the_initial_status() {
        let record = fixture_record();
        let snapshot = must_ok(record.created_snapshot());
        assert_eq!(
            snapshot.get("status"),
            Some(&Value::String("pending".to_string()))
        );
        assert_eq!(
            snapshot.get("total_amount"),
            Some(&Value::String("1250.00".to_string()))
        );
    }

    #[test]
    fn retry_policy_retries_only_transient_errors() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        };

        let mut transient_calls = 0_u32;
        let outcome: LedgerResult<u32> = policy.run(|| {
            transient_calls += 1;
            if transient_calls < 3 {
                Err(LedgerError::transient("upsert", "INV-1", "database is locked"))
            } else {
                Ok(transient_calls)
            }
        });
        assert_eq!(outcome, Ok(3));

        let mut validation_calls = 0_u32;
        let outcome: LedgerResult<u32> = policy.run(|| {
            validation_calls += 1;
            Err(LedgerError::validation("upsert", "INV-1", "bad currency"))
        });
        assert!(outcome.is_err());
        assert_eq!(validation_calls, 1);
    }

    #[test]
    fn retry_policy_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 2.0,
        };

        let mut calls = 0_u32;
        let outcome: LedgerResult<()> = policy.run(|| {
            calls += 1;
            Err(LedgerError::transient("transition_status", "INV-2", "busy"))
        });
        assert_eq!(calls, 2);
        assert!(matches!(outcome, Err(LedgerError::Transient { .. })));
    }

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-03-14T09:30:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not-a-timestamp").is_err());
    }

    #[test]
    fn timestamps_round_trip() {
        let original = fixture_timestamp();
        let formatted = must_ok(format_rfc3339(original));
        assert_eq!(must_ok(parse_rfc3339_utc(&formatted)), original);
    }

    #[test]
    fn errors_expose_operation_and_invoice_number() {
        let err = LedgerError::invalid_transition(
            "transition_status",
            "INV-77",
            InvoiceStatus::Pending,
            InvoiceStatus::Paid,
        );
        assert_eq!(err.operation(), "transition_status");
        assert_eq!(err.invoice_number(), "INV-77");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("pending -> paid"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_two_decimal_amounts_survive_storage_round_trip(cents in 0_i64..1_000_000_000_000) {
            let amount = Decimal::new(cents, 2);
            let stored = must_ok(amount_to_stored(amount));
            let recovered = must_ok(amount_from_stored(stored));
            prop_assert_eq!(recovered, amount);
        }

        #[test]
        fn prop_transitions_out_of_terminal_states_are_rejected(code in 0_usize..5, target in 0_usize..5) {
            let from = InvoiceStatus::ALL[code];
            let to = InvoiceStatus::ALL[target];
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        #[test]
        fn prop_amounts_with_extra_scale_fail_validation(cents in 1_i64..1_000_000, scale in 3_u32..6) {
            let mut draft = fixture_draft();
            draft.total_amount = Decimal::new(cents, scale);
            if draft.total_amount.round_dp(2) != draft.total_amount {
                prop_assert!(!draft.validate().is_valid());
            }
        }
    }
}
