use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    invoice_ledger_cli::init_tracing();
    let cli = invoice_ledger_cli::Cli::parse();
    invoice_ledger_cli::run_cli(cli)
}
