use super::validator::{IntegrityIssue, customer_balance_issue};
use crate::config::Settings;
use crate::domain::audit::AuditEntry;
use crate::domain::customer::{Customer, CustomerTransaction, SubLedgerBalances, compute_customer_balances};
use crate::domain::money::Balance;
use crate::domain::ports::{Document, PageCursor, Stores};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Write the recomputed balances back and record an audit entry.
    pub auto_correct: bool,
    /// Emit a `ledgerguard::alert` warning for every discrepancy.
    pub alert_on_discrepancy: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BulkOptions {
    pub batch_size: usize,
    pub reconcile: ReconcileOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerReconciliation {
    pub customer_id: String,
    pub stored_pending: Balance,
    pub stored_advance: Balance,
    pub computed: SubLedgerBalances,
    pub discrepancy: Option<IntegrityIssue>,
    pub corrected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationError {
    pub customer_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReconciliationSummary {
    pub total_customers: usize,
    pub reconciled: usize,
    pub discrepancies_found: usize,
    pub corrected: usize,
    pub errors: Vec<ReconciliationError>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatementLine {
    pub transaction_date: DateTime<Utc>,
    pub transaction_number: String,
    pub transaction_type: String,
    pub description: Option<String>,
    pub balance_impact: Balance,
    pub affects_pending_balance: bool,
    pub affects_advance_balance: bool,
    pub running_pending: Balance,
    pub running_advance: Balance,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub customer_id: String,
    pub customer_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub opening: SubLedgerBalances,
    pub lines: Vec<StatementLine>,
    /// Sum of positive impacts in the period.
    pub total_charges: Balance,
    /// Sum of negative impacts in the period.
    pub total_credits: Balance,
    pub period: SubLedgerBalances,
    pub closing: SubLedgerBalances,
    pub live: SubLedgerBalances,
    pub stored_pending: Balance,
    pub stored_advance: Balance,
    pub in_sync: bool,
}

/// Recomputes customer balances from their sub-ledger and optionally
/// converges the cached values.
#[derive(Clone)]
pub struct ReconciliationEngine {
    stores: Stores,
    settings: Arc<Settings>,
}

impl ReconciliationEngine {
    pub fn new(stores: Stores, settings: Arc<Settings>) -> Self {
        Self { stores, settings }
    }

    async fn customer(&self, customer_id: &str) -> Result<Customer> {
        self.stores
            .customers
            .get(customer_id)
            .await?
            .filter(|c| !c.is_deleted)
            .ok_or_else(|| PaymentError::CustomerNotFound(customer_id.to_string()))
    }

    async fn entries(&self, customer_id: &str) -> Result<Vec<CustomerTransaction>> {
        let id = customer_id.to_string();
        let mut entries = self
            .stores
            .customer_transactions
            .find(&move |e: &CustomerTransaction| e.customer_id == id && !e.is_deleted)
            .await?;
        entries.sort_by(|a, b| {
            a.transaction_date
                .cmp(&b.transaction_date)
                .then_with(|| a.transaction_number.cmp(&b.transaction_number))
        });
        Ok(entries)
    }

    /// Recomputes one customer's balances. Without `auto_correct` nothing is
    /// written.
    ///
    /// The correction is a compare-and-set against the customer version read
    /// together with the sub-ledger. When it loses a race the whole
    /// comparison is redone on fresh state, up to `MAX_CONFLICT_RETRIES`
    /// times, after which `ConcurrencyConflict` is returned.
    pub async fn reconcile_customer_balance(
        &self,
        customer_id: &str,
        options: ReconcileOptions,
    ) -> Result<CustomerReconciliation> {
        let mut attempt = 0;
        loop {
            let customer = self.customer(customer_id).await?;
            let entries = self.entries(customer_id).await?;
            let computed = compute_customer_balances(&entries);
            let discrepancy = customer_balance_issue(
                customer_id,
                customer.pending_balance,
                customer.advance_balance,
                &computed,
                self.settings.balance_tolerance,
            );

            let mut corrected = false;
            if discrepancy.is_some() && options.auto_correct {
                match self.correct(&customer, &computed).await {
                    Ok(()) => corrected = true,
                    Err(PaymentError::ConcurrencyConflict { .. })
                        if attempt < self.settings.max_conflict_retries =>
                    {
                        attempt += 1;
                        debug!(customer_id, attempt, "customer changed during reconciliation, recomputing");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(issue) = &discrepancy
                && options.alert_on_discrepancy
            {
                warn!(
                    target: "ledgerguard::alert",
                    customer_id,
                    severity = ?issue.severity,
                    stored_pending = %customer.pending_balance,
                    computed_pending = %computed.pending_balance,
                    stored_advance = %customer.advance_balance,
                    computed_advance = %computed.advance_balance,
                    "customer balance discrepancy"
                );
            }

            return Ok(CustomerReconciliation {
                customer_id: customer_id.to_string(),
                stored_pending: customer.pending_balance,
                stored_advance: customer.advance_balance,
                computed,
                discrepancy,
                corrected,
            });
        }
    }

    /// Writes `computed` onto `before` under compare-and-set and audits it.
    async fn correct(&self, before: &Customer, computed: &SubLedgerBalances) -> Result<()> {
        let customer_id = before.id.as_str();
        let mut fixed = before.clone();
        fixed.pending_balance = computed.pending_balance;
        fixed.advance_balance = computed.advance_balance;
        fixed.balance_reconciled_at = Some(Utc::now());
        let after = self.stores.customers.update(fixed).await?;
        let entry = AuditEntry::new(
            Customer::COLLECTION,
            customer_id,
            "reconcile_balance",
            serde_json::json!({
                "pending_balance": before.pending_balance,
                "advance_balance": before.advance_balance,
            }),
            serde_json::json!({
                "pending_balance": after.pending_balance,
                "advance_balance": after.advance_balance,
            }),
            format!("recomputed from {} sub-ledger entries", computed.entry_count),
        );
        self.stores.audit_log.insert(entry).await?;
        info!(
            customer_id,
            pending = %after.pending_balance,
            advance = %after.advance_balance,
            "customer balance corrected"
        );
        Ok(())
    }

    /// Reconciles every customer, `batch_size` at a time. One customer's
    /// failure is recorded and does not stop the run.
    pub async fn reconcile_all_customer_balances(
        &self,
        options: BulkOptions,
    ) -> Result<BulkReconciliationSummary> {
        let timer = Instant::now();
        let mut summary = BulkReconciliationSummary::default();
        let mut cursor = PageCursor::new(self.stores.customers.as_ref(), options.batch_size);

        while let Some(batch) = cursor.next_page().await? {
            let mut tasks = JoinSet::new();
            for customer in batch.into_iter().filter(|c| !c.is_deleted) {
                summary.total_customers += 1;
                let engine = self.clone();
                tasks.spawn(async move {
                    let result = engine
                        .reconcile_customer_balance(&customer.id, options.reconcile)
                        .await;
                    (customer.id, result)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(outcome))) => {
                        summary.reconciled += 1;
                        if outcome.discrepancy.is_some() {
                            summary.discrepancies_found += 1;
                        }
                        if outcome.corrected {
                            summary.corrected += 1;
                        }
                    }
                    Ok((customer_id, Err(e))) => {
                        error!(%customer_id, error = %e, "reconciliation failed");
                        summary.errors.push(ReconciliationError {
                            customer_id,
                            error: e.to_string(),
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "reconciliation task aborted");
                        summary.errors.push(ReconciliationError {
                            customer_id: String::new(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        summary.duration_ms = timer.elapsed().as_millis() as u64;
        info!(
            total = summary.total_customers,
            reconciled = summary.reconciled,
            discrepancies = summary.discrepancies_found,
            corrected = summary.corrected,
            errors = summary.errors.len(),
            "bulk reconciliation finished"
        );
        Ok(summary)
    }

    /// Read-only statement of the customer's sub-ledger between `start` and
    /// `end` (both inclusive), with the live versus stored comparison.
    pub async fn get_reconciliation_report(
        &self,
        customer_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReconciliationReport> {
        if end < start {
            return Err(PaymentError::ValidationError(format!(
                "report range ends ({end}) before it starts ({start})"
            )));
        }
        let customer = self.customer(customer_id).await?;
        let entries = self.entries(customer_id).await?;

        let opening = compute_customer_balances(entries.iter().filter(|e| e.transaction_date < start));
        let in_period: Vec<&CustomerTransaction> = entries
            .iter()
            .filter(|e| e.transaction_date >= start && e.transaction_date <= end)
            .collect();
        let period = compute_customer_balances(in_period.iter().copied());

        let mut running = opening;
        let mut total_charges = Balance::ZERO;
        let mut total_credits = Balance::ZERO;
        let lines = in_period
            .iter()
            .map(|e| {
                running += compute_customer_balances(std::iter::once(*e));
                if e.balance_impact > Balance::ZERO {
                    total_charges += e.balance_impact;
                } else {
                    total_credits += e.balance_impact;
                }
                StatementLine {
                    transaction_date: e.transaction_date,
                    transaction_number: e.transaction_number.clone(),
                    transaction_type: e.transaction_type.clone(),
                    description: e.description.clone(),
                    balance_impact: e.balance_impact,
                    affects_pending_balance: e.affects_pending_balance,
                    affects_advance_balance: e.affects_advance_balance,
                    running_pending: running.pending_balance,
                    running_advance: running.advance_balance,
                }
            })
            .collect();

        let mut closing = opening;
        closing += period;
        let live = compute_customer_balances(&entries);
        let tolerance = self.settings.balance_tolerance;
        let in_sync = customer.pending_balance.approx_eq(live.pending_balance, tolerance)
            && customer.advance_balance.approx_eq(live.advance_balance, tolerance);

        Ok(ReconciliationReport {
            customer_id: customer.id,
            customer_name: customer.name,
            start,
            end,
            opening,
            lines,
            total_charges,
            total_credits,
            period,
            closing,
            live,
            stored_pending: customer.pending_balance,
            stored_advance: customer.advance_balance,
            in_sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn entry(
        id: &str,
        customer_id: &str,
        day: u32,
        impact: Decimal,
        advance: bool,
    ) -> CustomerTransaction {
        CustomerTransaction {
            id: id.to_string(),
            transaction_number: format!("CT-{id}"),
            customer_id: customer_id.to_string(),
            transaction_type: if impact > Decimal::ZERO { "invoice" } else { "payment" }.to_string(),
            transaction_date: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            description: None,
            balance_impact: Balance::new(impact),
            affects_pending_balance: !advance,
            affects_advance_balance: advance,
            order_id: None,
            is_deleted: false,
            version: 0,
        }
    }

    fn customer(id: &str, pending: Decimal) -> Customer {
        Customer {
            id: id.to_string(),
            name: format!("Customer {id}"),
            pending_balance: Balance::new(pending),
            advance_balance: Balance::ZERO,
            is_deleted: false,
            balance_reconciled_at: None,
            version: 0,
        }
    }

    async fn engine() -> (Stores, ReconciliationEngine) {
        let stores = Stores::in_memory();
        stores.customers.insert(customer("cus-1", dec!(999.00))).await.unwrap();
        for e in [
            entry("1", "cus-1", 1, dec!(300.00), false),
            entry("2", "cus-1", 5, dec!(-100.00), false),
            entry("3", "cus-1", 10, dec!(50.00), false),
            entry("4", "cus-1", 12, dec!(20.00), true),
        ] {
            stores.customer_transactions.insert(e).await.unwrap();
        }
        let engine = ReconciliationEngine::new(stores.clone(), Arc::new(Settings::default()));
        (stores, engine)
    }

    #[tokio::test]
    async fn test_report_only_never_mutates() {
        let (stores, engine) = engine().await;
        let outcome = engine
            .reconcile_customer_balance(
                "cus-1",
                ReconcileOptions {
                    auto_correct: false,
                    alert_on_discrepancy: true,
                },
            )
            .await
            .unwrap();
        assert!(outcome.discrepancy.is_some());
        assert!(!outcome.corrected);
        assert_eq!(outcome.computed.pending_balance, Balance::new(dec!(250.00)));

        let stored = stores.customers.get("cus-1").await.unwrap().unwrap();
        assert_eq!(stored.pending_balance, Balance::new(dec!(999.00)));
        assert_eq!(stored.version, 0);
        assert!(stores.audit_log.page(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_correct_converges() {
        let (stores, engine) = engine().await;
        let options = ReconcileOptions {
            auto_correct: true,
            alert_on_discrepancy: false,
        };
        let first = engine.reconcile_customer_balance("cus-1", options).await.unwrap();
        assert!(first.corrected);

        let stored = stores.customers.get("cus-1").await.unwrap().unwrap();
        assert_eq!(stored.pending_balance, Balance::new(dec!(250.00)));
        assert_eq!(stored.advance_balance, Balance::new(dec!(20.00)));
        assert!(stored.balance_reconciled_at.is_some());
        assert_eq!(stores.audit_log.page(None, 10).await.unwrap().len(), 1);

        let second = engine.reconcile_customer_balance("cus-1", options).await.unwrap();
        assert!(second.discrepancy.is_none());
        assert!(!second.corrected);
    }

    #[tokio::test]
    async fn test_unknown_customer() {
        let (_, engine) = engine().await;
        let result = engine
            .reconcile_customer_balance("nobody", ReconcileOptions::default())
            .await;
        assert!(matches!(result, Err(PaymentError::CustomerNotFound(_))));
    }

    #[tokio::test]
    async fn test_bulk_reconciliation_in_batches() {
        let (stores, engine) = engine().await;
        for i in 2..=5 {
            stores
                .customers
                .insert(customer(&format!("cus-{i}"), Decimal::ZERO))
                .await
                .unwrap();
        }
        let summary = engine
            .reconcile_all_customer_balances(BulkOptions {
                batch_size: 2,
                reconcile: ReconcileOptions {
                    auto_correct: true,
                    alert_on_discrepancy: false,
                },
            })
            .await
            .unwrap();
        assert_eq!(summary.total_customers, 5);
        assert_eq!(summary.reconciled, 5);
        assert_eq!(summary.discrepancies_found, 1);
        assert_eq!(summary.corrected, 1);
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn test_report_running_balances() {
        let (_, engine) = engine().await;
        let report = engine
            .get_reconciliation_report(
                "cus-1",
                Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(report.opening.pending_balance, Balance::new(dec!(300.00)));
        assert_eq!(report.lines.len(), 2);
        assert_eq!(report.lines[0].running_pending, Balance::new(dec!(200.00)));
        assert_eq!(report.lines[1].running_pending, Balance::new(dec!(250.00)));
        assert_eq!(report.total_charges, Balance::new(dec!(50.00)));
        assert_eq!(report.total_credits, Balance::new(dec!(-100.00)));
        assert_eq!(report.closing.pending_balance, Balance::new(dec!(250.00)));
        assert_eq!(report.live.advance_balance, Balance::new(dec!(20.00)));
        assert!(!report.in_sync);
    }

    #[tokio::test]
    async fn test_report_rejects_inverted_range() {
        let (_, engine) = engine().await;
        let result = engine
            .get_reconciliation_report(
                "cus-1",
                Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            )
            .await;
        assert!(matches!(result, Err(PaymentError::ValidationError(_))));
    }
}
