//! Read-only audit of the account slot ledger.
//!
//! Prints one JSON document describing every inconsistency found and exits
//! non-zero when `--fail-on-findings` is set and the ledger is not clean.

use std::process::ExitCode;

use account_slots::{config::ConfigLoader, db, slots::audit::audit_ledger};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "audit_slot_ledger", about = "Check the slot ledger for inconsistencies")]
struct Args {
    /// Overrides SLOTS_DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    /// Exit with status 2 when any finding is reported
    #[arg(long)]
    fail_on_findings: bool,

    /// Emit compact single-line JSON
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut config = ConfigLoader::new().load().context("loading configuration")?;
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    config
        .slots
        .validate()
        .context("validating slot quota configuration")?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    let report = audit_ledger(&db, &config.slots, Utc::now())
        .await
        .context("auditing slot ledger")?;

    let rendered = if args.compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };
    println!("{rendered}");

    if args.fail_on_findings && !report.is_clean() {
        eprintln!("{} finding(s) reported", report.findings.len());
        return Ok(ExitCode::from(2));
    }

    Ok(ExitCode::SUCCESS)
}
