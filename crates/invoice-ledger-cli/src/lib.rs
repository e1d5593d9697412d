//! `invl` command surface for the invoice ledger.
//!
//! Host processes embed ledger behavior through:
//! - [`run_cli`] for full parsed CLI execution (opens and migrates the DB).
//! - [`run_command`] for direct [`Command`] execution against an existing
//!   [`SqliteInvoiceStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use invoice_ledger_core::{
    parse_rfc3339_utc, InvoiceDraft, InvoiceFilter, InvoiceId, InvoiceStatus, ListCursor,
    RetryPolicy,
};
use invoice_ledger_store_sqlite::SqliteInvoiceStore;
use rust_decimal::Decimal;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "invl")]
#[command(about = "Invoice Ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./invoice_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upsert a parsed invoice payload (insert-or-update by invoice number).
    Ingest(IngestArgs),
    /// Move an invoice along the status lifecycle.
    Transition(TransitionArgs),
    /// Print the current record for one invoice number.
    Show(ShowArgs),
    /// Print records matching the filter, oldest first.
    List(ListArgs),
    /// Print the audit trail for one invoice number, oldest first.
    Audit(AuditArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    invoice_number: String,
    #[arg(long)]
    vendor_name: String,
    /// RFC3339 UTC timestamp, e.g. 2026-03-14T00:00:00Z.
    #[arg(long)]
    invoice_date: String,
    #[arg(long)]
    due_date: Option<String>,
    #[arg(long)]
    total_amount: Decimal,
    #[arg(long, default_value = "USD")]
    currency: String,
    #[arg(long)]
    po_number: Option<String>,
    #[arg(long)]
    raw_text: Option<String>,
    #[arg(long)]
    email_from: Option<String>,
    #[arg(long)]
    email_subject: Option<String>,
}

#[derive(Debug, Args)]
pub struct TransitionArgs {
    #[arg(long)]
    invoice_number: String,
    #[arg(long)]
    to: StatusArg,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    invoice_number: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    vendor_name: Option<String>,
    #[arg(long)]
    date_from: Option<String>,
    #[arg(long)]
    date_to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    /// Resume after this record position (pass both cursor halves).
    #[arg(long)]
    after_created_at: Option<String>,
    #[arg(long)]
    after_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    #[arg(long)]
    invoice_number: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Approved,
    Rejected,
    Paid,
    Void,
}

impl From<StatusArg> for InvoiceStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => Self::Pending,
            StatusArg::Approved => Self::Approved,
            StatusArg::Rejected => Self::Rejected,
            StatusArg::Paid => Self::Paid,
            StatusArg::Void => Self::Void,
        }
    }
}

/// Installs the stderr tracing subscriber (stdout stays JSON-only).
/// Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Opens (and migrates) the database named by `--db`, then executes the
/// parsed command.
///
/// # Errors
/// Returns an error when open/migrate fails or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteInvoiceStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

/// Executes a parsed command against an existing store handle. Mutating
/// commands retry transient contention with the default backoff policy.
///
/// # Errors
/// Returns an error when argument parsing, validation, or persistence fails.
pub fn run_command(command: Command, store: &mut SqliteInvoiceStore) -> Result<()> {
    match command {
        Command::Ingest(args) => {
            let draft = draft_from_args(&args)?;
            let result = RetryPolicy::default().run(|| store.upsert(&draft))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Transition(args) => {
            let record = RetryPolicy::default()
                .run(|| store.transition_status(&args.invoice_number, args.to.into()))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Show(args) => {
            let record = store.get(&args.invoice_number)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::List(args) => {
            let filter = filter_from_args(&args)?;
            let records = store.list(&filter)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::Audit(args) => {
            let entries = store.audit_trail(&args.invoice_number, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
    }
}

fn draft_from_args(args: &IngestArgs) -> Result<InvoiceDraft> {
    let invoice_date = parse_rfc3339_utc(&args.invoice_date)
        .map_err(|err| anyhow!("invalid --invoice-date: {err}"))?;
    let due_date = args
        .due_date
        .as_deref()
        .map(|raw| parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid --due-date: {err}")))
        .transpose()?;

    Ok(InvoiceDraft {
        invoice_number: args.invoice_number.clone(),
        vendor_name: args.vendor_name.clone(),
        invoice_date,
        due_date,
        total_amount: args.total_amount,
        currency: args.currency.clone(),
        po_number: args.po_number.clone(),
        raw_text: args.raw_text.clone(),
        email_from: args.email_from.clone(),
        email_subject: args.email_subject.clone(),
    })
}

fn filter_from_args(args: &ListArgs) -> Result<InvoiceFilter> {
    let invoice_date_from = args
        .date_from
        .as_deref()
        .map(|raw| parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid --date-from: {err}")))
        .transpose()?;
    let invoice_date_to = args
        .date_to
        .as_deref()
        .map(|raw| parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid --date-to: {err}")))
        .transpose()?;

    let after = match (args.after_created_at.as_deref(), args.after_id.as_deref()) {
        (Some(created_at_raw), Some(id_raw)) => {
            let created_at = parse_rfc3339_utc(created_at_raw)
                .map_err(|err| anyhow!("invalid --after-created-at: {err}"))?;
            let id = Ulid::from_string(id_raw)
                .map_err(|err| anyhow!("invalid --after-id ULID: {err}"))?;
            Some(ListCursor {
                created_at,
                id: InvoiceId(id),
            })
        }
        (None, None) => None,
        _ => {
            return Err(anyhow!(
                "--after-created-at and --after-id must be provided together"
            ))
        }
    };

    Ok(InvoiceFilter {
        status: args.status.map(InvoiceStatus::from),
        vendor_name: args.vendor_name.clone(),
        invoice_date_from,
        invoice_date_to,
        after,
        limit: args.limit,
    })
}
