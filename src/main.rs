use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use ledgerguard::application::orchestrator::PaymentOrchestrator;
use ledgerguard::application::reconciliation::{BulkOptions, ReconcileOptions, ReconciliationEngine};
use ledgerguard::application::recovery::RecoverySweep;
use ledgerguard::application::validator::{IssueCategory, LedgerValidator};
use ledgerguard::config::Settings;
use ledgerguard::domain::gateway::GatewayRegistry;
use ledgerguard::domain::ports::Stores;
use ledgerguard::interfaces::csv::issue_writer::IssueWriter;
use ledgerguard::interfaces::json::snapshot::Snapshot;
use ledgerguard::telemetry;
use miette::{IntoDiagnostic, Result, miette};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON dump of the store to load before running the command
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Write the store back out as a snapshot after the command
    #[arg(long, global = true)]
    save_snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Audit the ledger, sub-ledgers and inventory
    Validate {
        /// Run only these checks (repeatable); all checks by default
        #[arg(long = "check", value_enum)]
        checks: Vec<Check>,

        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Run every audit and repair the issues that can be repaired safely
    Fix,
    /// Recompute customer balances from their sub-ledger entries
    Reconcile {
        /// Reconcile a single customer
        #[arg(long)]
        customer: Option<String>,

        /// Write recomputed balances back to the customer records
        #[arg(long)]
        auto_correct: bool,

        /// Log every discrepancy as an alert
        #[arg(long)]
        alert: bool,

        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Statement of one customer's sub-ledger over a date range
    Report {
        #[arg(long)]
        customer: String,

        /// First day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,
    },
    /// Resolve payments and refunds left in flight
    Recover,
}

#[derive(Clone, Copy, ValueEnum)]
enum Check {
    DoubleEntry,
    Referential,
    Duplicates,
    Inventory,
    CustomerBalances,
}

impl From<Check> for IssueCategory {
    fn from(check: Check) -> Self {
        match check {
            Check::DoubleEntry => IssueCategory::DoubleEntry,
            Check::Referential => IssueCategory::ReferentialIntegrity,
            Check::Duplicates => IssueCategory::Duplicates,
            Check::Inventory => IssueCategory::Inventory,
            Check::CustomerBalances => IssueCategory::CustomerBalance,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();
    let settings = Arc::new(Settings::from_env().into_diagnostic()?);
    let stores = open_stores(&cli).await?;

    match cli.command {
        Command::Validate { checks, format } => {
            let validator = LedgerValidator::new(stores.clone(), settings);
            let result = if checks.is_empty() {
                validator.run_all_validations().await
            } else {
                let categories: Vec<IssueCategory> = checks.into_iter().map(Into::into).collect();
                validator.run_checks(&categories).await
            };
            let report = result.into_diagnostic()?;

            match format {
                Format::Json => print_json(&report)?,
                Format::Csv => IssueWriter::new(io::stdout().lock())
                    .write_issues(&report.issues)
                    .into_diagnostic()?,
            }
        }
        Command::Fix => {
            let validator = LedgerValidator::new(stores.clone(), settings);
            let report = validator.run_all_validations().await.into_diagnostic()?;
            let fixes = validator.fix_issues(&report.issues).await.into_diagnostic()?;
            print_json(&fixes)?;
        }
        Command::Reconcile {
            customer,
            auto_correct,
            alert,
            batch_size,
        } => {
            let reconcile = ReconcileOptions {
                auto_correct,
                alert_on_discrepancy: alert,
            };
            let batch_size = batch_size.unwrap_or(settings.reconciliation_batch_size);
            let engine = ReconciliationEngine::new(stores.clone(), settings);
            match customer {
                Some(id) => {
                    let result = engine
                        .reconcile_customer_balance(&id, reconcile)
                        .await
                        .into_diagnostic()?;
                    print_json(&result)?;
                }
                None => {
                    if batch_size == 0 {
                        return Err(miette!("--batch-size must be at least 1"));
                    }
                    let summary = engine
                        .reconcile_all_customer_balances(BulkOptions {
                            batch_size,
                            reconcile,
                        })
                        .await
                        .into_diagnostic()?;
                    print_json(&summary)?;
                }
            }
        }
        Command::Report { customer, from, to } => {
            let (start, end) = day_range(from, to)?;
            let engine = ReconciliationEngine::new(stores.clone(), settings);
            let report = engine
                .get_reconciliation_report(&customer, start, end)
                .await
                .into_diagnostic()?;
            print_json(&report)?;
        }
        Command::Recover => {
            let gateways = GatewayRegistry::from_settings(&settings).into_diagnostic()?;
            let orchestrator = PaymentOrchestrator::new(stores.clone(), gateways, settings.clone());
            let report = RecoverySweep::new(orchestrator, stores.clone(), settings)
                .run()
                .await
                .into_diagnostic()?;
            print_json(&report)?;
        }
    }

    if let Some(path) = &cli.save_snapshot {
        Snapshot::capture(&stores)
            .await
            .into_diagnostic()?
            .save(path)
            .into_diagnostic()?;
    }

    Ok(())
}

async fn open_stores(cli: &Cli) -> Result<Stores> {
    let stores = match &cli.db_path {
        Some(path) => open_persistent(path)?,
        None => Stores::in_memory(),
    };
    if let Some(path) = &cli.snapshot {
        Snapshot::load(path)
            .into_diagnostic()?
            .load_into(&stores)
            .await
            .into_diagnostic()?;
    }
    Ok(stores)
}

#[cfg(feature = "storage-rocksdb")]
fn open_persistent(path: &Path) -> Result<Stores> {
    use ledgerguard::infrastructure::rocksdb::RocksDBStore;
    Ok(RocksDBStore::open(path).into_diagnostic()?.into_stores())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_persistent(_path: &Path) -> Result<Stores> {
    eprintln!(
        "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
    );
    Ok(Stores::in_memory())
}

/// Whole days, `from` 00:00:00 through `to` 23:59:59.999999999 UTC.
fn day_range(from: NaiveDate, to: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = from.and_time(NaiveTime::MIN).and_utc();
    let end = to
        .and_hms_nano_opt(23, 59, 59, 999_999_999)
        .ok_or_else(|| miette!("invalid --to date: {to}"))?
        .and_utc();
    Ok((start, end))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).into_diagnostic()?;
    writeln!(out).into_diagnostic()?;
    Ok(())
}
