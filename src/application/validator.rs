//! Read-only audits proving the stored records are internally consistent.
//!
//! Every audit is a streaming reducer over [`PageCursor`]: no collection is
//! loaded whole, and memory grows with the number of distinct keys
//! (accounts, customers, transaction numbers) rather than with the number of
//! records. Audits run against live traffic; a write landing mid-scan can
//! produce a false positive that clears on the next run.

use super::retry::update_with_retry;
use crate::config::Settings;
use crate::domain::audit::AuditEntry;
use crate::domain::customer::{SubLedgerBalances, compute_customer_balances};
use crate::domain::inventory::{InventoryRecord, Product};
use crate::domain::money::Balance;
use crate::domain::ports::{Document, PageCursor, Stores};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Double-entry differences above this are high severity.
const HIGH_LEDGER_DIFFERENCE: Decimal = dec!(100);
/// Customer balance differences above this are high severity.
const HIGH_CUSTOMER_DIFFERENCE: Decimal = dec!(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    DoubleEntry,
    ReferentialIntegrity,
    Duplicates,
    Inventory,
    CustomerBalance,
}

impl IssueCategory {
    pub const ALL: [IssueCategory; 5] = [
        IssueCategory::DoubleEntry,
        IssueCategory::ReferentialIntegrity,
        IssueCategory::Duplicates,
        IssueCategory::Inventory,
        IssueCategory::CustomerBalance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IssueCategory::DoubleEntry => "double_entry",
            IssueCategory::ReferentialIntegrity => "referential_integrity",
            IssueCategory::Duplicates => "duplicates",
            IssueCategory::Inventory => "inventory",
            IssueCategory::CustomerBalance => "customer_balance",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    DoubleEntryMismatch,
    OrphanedOrder,
    OrphanedCustomer,
    OrphanedAccount,
    DuplicateTransaction,
    DuplicateCustomerTransaction,
    StockSyncMismatch,
    NegativeStock,
    ReservedExceedsCurrent,
    IncorrectAvailableStock,
    MissingInventoryRecord,
    CustomerBalanceMismatch,
}

impl IssueKind {
    pub fn category(self) -> IssueCategory {
        match self {
            IssueKind::DoubleEntryMismatch => IssueCategory::DoubleEntry,
            IssueKind::OrphanedOrder | IssueKind::OrphanedCustomer | IssueKind::OrphanedAccount => {
                IssueCategory::ReferentialIntegrity
            }
            IssueKind::DuplicateTransaction | IssueKind::DuplicateCustomerTransaction => {
                IssueCategory::Duplicates
            }
            IssueKind::StockSyncMismatch
            | IssueKind::NegativeStock
            | IssueKind::ReservedExceedsCurrent
            | IssueKind::IncorrectAvailableStock
            | IssueKind::MissingInventoryRecord => IssueCategory::Inventory,
            IssueKind::CustomerBalanceMismatch => IssueCategory::CustomerBalance,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::DoubleEntryMismatch => "double_entry_mismatch",
            IssueKind::OrphanedOrder => "orphaned_order",
            IssueKind::OrphanedCustomer => "orphaned_customer",
            IssueKind::OrphanedAccount => "orphaned_account",
            IssueKind::DuplicateTransaction => "duplicate_transaction",
            IssueKind::DuplicateCustomerTransaction => "duplicate_customer_transaction",
            IssueKind::StockSyncMismatch => "stock_sync_mismatch",
            IssueKind::NegativeStock => "negative_stock",
            IssueKind::ReservedExceedsCurrent => "reserved_exceeds_current",
            IssueKind::IncorrectAvailableStock => "incorrect_available_stock",
            IssueKind::MissingInventoryRecord => "missing_inventory_record",
            IssueKind::CustomerBalanceMismatch => "customer_balance_mismatch",
        }
    }

    /// Repairs `fix_issues` may apply without a human in the loop.
    pub fn is_auto_fixable(self) -> bool {
        matches!(
            self,
            IssueKind::IncorrectAvailableStock | IssueKind::StockSyncMismatch
        )
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssueDetails {
    DoubleEntry {
        account_code: String,
        expected_balance: Balance,
        stored_balance: Balance,
        difference: Decimal,
        transaction_count: usize,
    },
    Orphan {
        entity: &'static str,
        entity_id: String,
        reference: &'static str,
        referenced_id: String,
    },
    Duplicate {
        key: String,
        ids: Vec<String>,
    },
    Inventory {
        product_stock: i64,
        current_stock: Option<i64>,
        reserved_stock: Option<i64>,
        available_stock: Option<i64>,
        expected_available: Option<i64>,
    },
    CustomerBalance {
        stored_pending: Balance,
        computed_pending: Balance,
        stored_advance: Balance,
        computed_advance: Balance,
        entry_count: usize,
    },
}

/// One discrepancy. Never raised as an error: audits return these as data
/// for review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityIssue {
    pub kind: IssueKind,
    pub category: IssueCategory,
    pub severity: Severity,
    /// Account code, document id, product id, customer id or duplicated key,
    /// depending on `kind`.
    pub entity_id: String,
    pub message: String,
    pub details: IssueDetails,
}

impl IntegrityIssue {
    fn new(kind: IssueKind, severity: Severity, entity_id: impl Into<String>, message: String, details: IssueDetails) -> Self {
        Self {
            kind,
            category: kind.category(),
            severity,
            entity_id: entity_id.into(),
            message,
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_issues: usize,
    pub by_category: BTreeMap<IssueCategory, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub issues: Vec<IntegrityIssue>,
}

impl ValidationReport {
    fn new(started_at: DateTime<Utc>, timer: Instant, issues: Vec<IntegrityIssue>) -> Self {
        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for issue in &issues {
            *by_category.entry(issue.category).or_insert(0) += 1;
            *by_severity.entry(issue.severity).or_insert(0) += 1;
        }
        Self {
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
            total_issues: issues.len(),
            by_category,
            by_severity,
            issues,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FixOutcome {
    Fixed { action: String },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FixResult {
    pub kind: IssueKind,
    pub entity_id: String,
    #[serde(flatten)]
    pub outcome: FixOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FixReport {
    pub fixed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<FixResult>,
}

#[derive(Default)]
struct AccountTotals {
    debits: Decimal,
    credits: Decimal,
    count: usize,
}

/// Batch auditor over the ledger, the customer sub-ledgers and inventory.
#[derive(Clone)]
pub struct LedgerValidator {
    stores: Stores,
    settings: Arc<Settings>,
}

impl LedgerValidator {
    pub fn new(stores: Stores, settings: Arc<Settings>) -> Self {
        Self { stores, settings }
    }

    fn page_size(&self) -> usize {
        self.settings.audit_page_size
    }

    /// Compares every active account's cached balance with the balance implied
    /// by its settled transactions.
    pub async fn check_double_entry(&self) -> Result<Vec<IntegrityIssue>> {
        let mut totals: HashMap<String, AccountTotals> = HashMap::new();
        let mut cursor = PageCursor::new(self.stores.transactions.as_ref(), self.page_size());
        while let Some(page) = cursor.next_page().await? {
            for tx in page.iter().filter(|t| t.is_posted_status()) {
                let entry = totals.entry(tx.account_code.clone()).or_default();
                entry.debits += tx.debit_amount;
                entry.credits += tx.credit_amount;
                entry.count += 1;
            }
        }

        let tolerance = self.settings.balance_tolerance;
        let mut issues = Vec::new();
        let mut cursor = PageCursor::new(self.stores.accounts.as_ref(), self.page_size());
        while let Some(page) = cursor.next_page().await? {
            for account in page.iter().filter(|a| a.is_active && !a.is_deleted) {
                let sums = totals.remove(&account.account_code).unwrap_or_default();
                let expected = account.expected_balance(sums.debits, sums.credits);
                if expected.approx_eq(account.current_balance, tolerance) {
                    continue;
                }
                let difference = (expected - account.current_balance).value();
                let severity = if difference.abs() > HIGH_LEDGER_DIFFERENCE {
                    Severity::High
                } else {
                    Severity::Medium
                };
                warn!(
                    account_code = %account.account_code,
                    expected = %expected,
                    stored = %account.current_balance,
                    "double-entry mismatch"
                );
                issues.push(IntegrityIssue::new(
                    IssueKind::DoubleEntryMismatch,
                    severity,
                    account.account_code.clone(),
                    format!(
                        "account {} balance {} does not match {} derived from {} transaction(s)",
                        account.account_code, account.current_balance, expected, sums.count
                    ),
                    IssueDetails::DoubleEntry {
                        account_code: account.account_code.clone(),
                        expected_balance: expected,
                        stored_balance: account.current_balance,
                        difference,
                        transaction_count: sums.count,
                    },
                ));
            }
        }
        Ok(issues)
    }

    /// Checks that a bounded sample of transactions and sub-ledger entries
    /// still point at live orders, customers and accounts.
    pub async fn check_referential_integrity(&self) -> Result<Vec<IntegrityIssue>> {
        let sample = self.settings.referential_sample_size;
        let mut refs = ReferenceCache::new(&self.stores);
        let mut issues = Vec::new();

        let transactions = self.stores.transactions.page(None, sample).await?;
        for tx in transactions.iter().filter(|t| !t.is_deleted) {
            if let Some(order_id) = &tx.order_id
                && !refs.order(order_id).await?
            {
                issues.push(orphan(IssueKind::OrphanedOrder, "transaction", &tx.id, "order", order_id));
            }
            if let Some(customer_id) = &tx.customer_id
                && !refs.customer(customer_id).await?
            {
                issues.push(orphan(IssueKind::OrphanedCustomer, "transaction", &tx.id, "customer", customer_id));
            }
            if !refs.account(&tx.account_code).await? {
                issues.push(orphan(
                    IssueKind::OrphanedAccount,
                    "transaction",
                    &tx.id,
                    "account",
                    &tx.account_code,
                ));
            }
        }

        let entries = self.stores.customer_transactions.page(None, sample).await?;
        for entry in entries.iter().filter(|e| !e.is_deleted) {
            if !refs.customer(&entry.customer_id).await? {
                issues.push(orphan(
                    IssueKind::OrphanedCustomer,
                    "customer_transaction",
                    &entry.id,
                    "customer",
                    &entry.customer_id,
                ));
            }
            if let Some(order_id) = &entry.order_id
                && !refs.order(order_id).await?
            {
                issues.push(orphan(
                    IssueKind::OrphanedOrder,
                    "customer_transaction",
                    &entry.id,
                    "order",
                    order_id,
                ));
            }
        }
        Ok(issues)
    }

    /// Groups transactions by transaction number and sub-ledger entries by
    /// entry number; every group with more than one member is reported.
    pub async fn check_duplicates(&self) -> Result<Vec<IntegrityIssue>> {
        let mut numbers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut cursor = PageCursor::new(self.stores.transactions.as_ref(), self.page_size());
        while let Some(page) = cursor.next_page().await? {
            for tx in page.into_iter().filter(|t| !t.is_deleted) {
                numbers.entry(tx.transaction_id).or_default().push(tx.id);
            }
        }
        let mut issues = duplicates(IssueKind::DuplicateTransaction, "transaction", numbers);

        let mut numbers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut cursor =
            PageCursor::new(self.stores.customer_transactions.as_ref(), self.page_size());
        while let Some(page) = cursor.next_page().await? {
            for entry in page.into_iter().filter(|e| !e.is_deleted) {
                numbers
                    .entry(entry.transaction_number)
                    .or_default()
                    .push(entry.id);
            }
        }
        issues.extend(duplicates(
            IssueKind::DuplicateCustomerTransaction,
            "customer transaction",
            numbers,
        ));
        Ok(issues)
    }

    pub async fn check_inventory(&self) -> Result<Vec<IntegrityIssue>> {
        let mut issues = Vec::new();
        let mut cursor = PageCursor::new(self.stores.products.as_ref(), self.page_size());
        while let Some(page) = cursor.next_page().await? {
            for product in page.iter().filter(|p| p.is_active && !p.is_deleted) {
                let record = self.stores.inventory.get(&product.id).await?;
                issues.extend(inventory_issues(product, record.as_ref()));
            }
        }
        Ok(issues)
    }

    /// Recomputes every customer's pending and advance balances from the
    /// sub-ledger and compares them with the cached values.
    pub async fn check_customer_balances(&self) -> Result<Vec<IntegrityIssue>> {
        let mut computed: HashMap<String, SubLedgerBalances> = HashMap::new();
        let mut cursor =
            PageCursor::new(self.stores.customer_transactions.as_ref(), self.page_size());
        while let Some(page) = cursor.next_page().await? {
            for entry in &page {
                *computed.entry(entry.customer_id.clone()).or_default() +=
                    compute_customer_balances(std::iter::once(entry));
            }
        }

        let tolerance = self.settings.balance_tolerance;
        let mut issues = Vec::new();
        let mut cursor = PageCursor::new(self.stores.customers.as_ref(), self.page_size());
        while let Some(page) = cursor.next_page().await? {
            for customer in page.iter().filter(|c| !c.is_deleted) {
                let live = computed.remove(&customer.id).unwrap_or_default();
                if let Some(issue) = customer_balance_issue(
                    &customer.id,
                    customer.pending_balance,
                    customer.advance_balance,
                    &live,
                    tolerance,
                ) {
                    warn!(customer_id = %customer.id, "customer balance mismatch");
                    issues.push(issue);
                }
            }
        }
        Ok(issues)
    }

    /// Runs a single audit.
    pub async fn run_check(&self, category: IssueCategory) -> Result<Vec<IntegrityIssue>> {
        match category {
            IssueCategory::DoubleEntry => self.check_double_entry().await,
            IssueCategory::ReferentialIntegrity => self.check_referential_integrity().await,
            IssueCategory::Duplicates => self.check_duplicates().await,
            IssueCategory::Inventory => self.check_inventory().await,
            IssueCategory::CustomerBalance => self.check_customer_balances().await,
        }
    }

    /// Runs the selected audits and aggregates their issues.
    pub async fn run_checks(&self, categories: &[IssueCategory]) -> Result<ValidationReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let mut issues = Vec::new();
        for category in categories {
            issues.extend(self.run_check(*category).await?);
        }
        Ok(ValidationReport::new(started_at, timer, issues))
    }

    /// Runs all five audits concurrently.
    pub async fn run_all_validations(&self) -> Result<ValidationReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let (double_entry, referential, duplicates, inventory, customers) = tokio::try_join!(
            self.check_double_entry(),
            self.check_referential_integrity(),
            self.check_duplicates(),
            self.check_inventory(),
            self.check_customer_balances(),
        )?;
        let issues: Vec<IntegrityIssue> = [double_entry, referential, duplicates, inventory, customers]
            .into_iter()
            .flatten()
            .collect();
        let report = ValidationReport::new(started_at, timer, issues);
        info!(
            total_issues = report.total_issues,
            duration_ms = report.duration_ms,
            "validation finished"
        );
        Ok(report)
    }

    /// Applies the mechanically safe repairs: recomputing available stock
    /// and syncing cached stock to the higher of the two values. Ledger and
    /// duplicate issues are always skipped.
    pub async fn fix_issues(&self, issues: &[IntegrityIssue]) -> Result<FixReport> {
        let mut report = FixReport::default();
        for issue in issues {
            let outcome = if issue.kind.is_auto_fixable() {
                match self.fix_one(issue).await {
                    Ok(action) => FixOutcome::Fixed { action },
                    Err(e) => {
                        warn!(kind = %issue.kind, entity_id = %issue.entity_id, error = %e, "repair failed");
                        FixOutcome::Failed { error: e.to_string() }
                    }
                }
            } else {
                FixOutcome::Skipped {
                    reason: "requires manual review".to_string(),
                }
            };
            match outcome {
                FixOutcome::Fixed { .. } => report.fixed += 1,
                FixOutcome::Skipped { .. } => report.skipped += 1,
                FixOutcome::Failed { .. } => report.failed += 1,
            }
            report.results.push(FixResult {
                kind: issue.kind,
                entity_id: issue.entity_id.clone(),
                outcome,
            });
        }
        info!(fixed = report.fixed, skipped = report.skipped, failed = report.failed, "repairs applied");
        Ok(report)
    }

    async fn fix_one(&self, issue: &IntegrityIssue) -> Result<String> {
        let max = self.settings.max_conflict_retries;
        let product_id = issue.entity_id.as_str();
        match issue.kind {
            IssueKind::IncorrectAvailableStock => {
                let (after, before) = update_with_retry(
                    self.stores.inventory.as_ref(),
                    product_id,
                    max,
                    inventory_not_found,
                    |record: &mut InventoryRecord| {
                        let before = record.clone();
                        record.recompute_available();
                        Ok(before)
                    },
                )
                .await?;
                self.audit(
                    InventoryRecord::COLLECTION,
                    product_id,
                    "recompute_available_stock",
                    &before,
                    &after,
                )
                .await?;
                Ok(format!("available stock set to {}", after.available_stock))
            }
            IssueKind::StockSyncMismatch => {
                let product = self
                    .stores
                    .products
                    .get(product_id)
                    .await?
                    .ok_or_else(|| inventory_not_found(product_id.to_string()))?;
                let record = self
                    .stores
                    .inventory
                    .get(product_id)
                    .await?
                    .ok_or_else(|| inventory_not_found(product_id.to_string()))?;
                let target = product.current_stock.max(record.current_stock);

                let (after, before) = update_with_retry(
                    self.stores.inventory.as_ref(),
                    product_id,
                    max,
                    inventory_not_found,
                    |record: &mut InventoryRecord| {
                        let before = record.clone();
                        record.current_stock = target;
                        record.recompute_available();
                        Ok(before)
                    },
                )
                .await?;
                self.audit(InventoryRecord::COLLECTION, product_id, "sync_stock", &before, &after)
                    .await?;

                let (after, before) = update_with_retry(
                    self.stores.products.as_ref(),
                    product_id,
                    max,
                    inventory_not_found,
                    |product: &mut Product| {
                        let before = product.clone();
                        product.current_stock = target;
                        Ok(before)
                    },
                )
                .await?;
                self.audit(Product::COLLECTION, product_id, "sync_stock", &before, &after)
                    .await?;
                Ok(format!("stock synced to {target}"))
            }
            kind => Err(PaymentError::ValidationError(format!(
                "{kind} cannot be repaired automatically"
            ))),
        }
    }

    async fn audit<T: Serialize>(
        &self,
        entity: &str,
        entity_id: &str,
        action: &str,
        before: &T,
        after: &T,
    ) -> Result<()> {
        let entry = AuditEntry::new(
            entity,
            entity_id,
            action,
            serde_json::to_value(before)?,
            serde_json::to_value(after)?,
            "automatic repair from data integrity check",
        );
        self.stores.audit_log.insert(entry).await?;
        info!(entity, entity_id, action, "repair applied");
        Ok(())
    }
}

fn inventory_not_found(product_id: String) -> PaymentError {
    PaymentError::ValidationError(format!("no inventory record for product {product_id}"))
}

fn orphan(
    kind: IssueKind,
    entity: &'static str,
    entity_id: &str,
    reference: &'static str,
    referenced_id: &str,
) -> IntegrityIssue {
    IntegrityIssue::new(
        kind,
        Severity::Medium,
        entity_id,
        format!("{entity} {entity_id} references missing {reference} {referenced_id}"),
        IssueDetails::Orphan {
            entity,
            entity_id: entity_id.to_string(),
            reference,
            referenced_id: referenced_id.to_string(),
        },
    )
}

fn duplicates(
    kind: IssueKind,
    label: &str,
    groups: BTreeMap<String, Vec<String>>,
) -> Vec<IntegrityIssue> {
    groups
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(key, mut ids)| {
            ids.sort();
            IntegrityIssue::new(
                kind,
                Severity::High,
                key.clone(),
                format!("{label} number {key} is used by {} records", ids.len()),
                IssueDetails::Duplicate { key, ids },
            )
        })
        .collect()
}

fn inventory_issues(product: &Product, record: Option<&InventoryRecord>) -> Vec<IntegrityIssue> {
    let Some(record) = record else {
        return vec![IntegrityIssue::new(
            IssueKind::MissingInventoryRecord,
            Severity::Low,
            product.id.clone(),
            format!("product {} has no inventory record", product.id),
            IssueDetails::Inventory {
                product_stock: product.current_stock,
                current_stock: None,
                reserved_stock: None,
                available_stock: None,
                expected_available: None,
            },
        )];
    };

    let details = IssueDetails::Inventory {
        product_stock: product.current_stock,
        current_stock: Some(record.current_stock),
        reserved_stock: Some(record.reserved_stock),
        available_stock: Some(record.available_stock),
        expected_available: Some(record.expected_available()),
    };
    let mut found = Vec::new();
    let mut push = |kind, severity, message: String| {
        found.push(IntegrityIssue::new(kind, severity, product.id.clone(), message, details.clone()));
    };

    if record.current_stock < 0 || product.current_stock < 0 {
        push(
            IssueKind::NegativeStock,
            Severity::High,
            format!("product {} has negative stock", product.id),
        );
    }
    if record.reserved_stock > record.current_stock {
        push(
            IssueKind::ReservedExceedsCurrent,
            Severity::High,
            format!(
                "product {} reserves {} of {} in stock",
                product.id, record.reserved_stock, record.current_stock
            ),
        );
    }
    if product.current_stock != record.current_stock {
        push(
            IssueKind::StockSyncMismatch,
            Severity::Medium,
            format!(
                "product {} caches stock {} but inventory holds {}",
                product.id, product.current_stock, record.current_stock
            ),
        );
    }
    if record.available_stock != record.expected_available() {
        push(
            IssueKind::IncorrectAvailableStock,
            Severity::Low,
            format!(
                "product {} available stock {} should be {}",
                product.id,
                record.available_stock,
                record.expected_available()
            ),
        );
    }
    found
}

/// Shared with the reconciliation engine so both report identical issues.
pub(crate) fn customer_balance_issue(
    customer_id: &str,
    stored_pending: Balance,
    stored_advance: Balance,
    live: &SubLedgerBalances,
    tolerance: Decimal,
) -> Option<IntegrityIssue> {
    if stored_pending.approx_eq(live.pending_balance, tolerance)
        && stored_advance.approx_eq(live.advance_balance, tolerance)
    {
        return None;
    }
    let difference = (stored_pending - live.pending_balance)
        .value()
        .abs()
        .max((stored_advance - live.advance_balance).value().abs());
    let severity = if difference > HIGH_CUSTOMER_DIFFERENCE {
        Severity::High
    } else {
        Severity::Medium
    };
    Some(IntegrityIssue::new(
        IssueKind::CustomerBalanceMismatch,
        severity,
        customer_id,
        format!(
            "customer {customer_id} stores pending {stored_pending} / advance {stored_advance}, sub-ledger gives {} / {}",
            live.pending_balance, live.advance_balance
        ),
        IssueDetails::CustomerBalance {
            stored_pending,
            computed_pending: live.pending_balance,
            stored_advance,
            computed_advance: live.advance_balance,
            entry_count: live.entry_count,
        },
    ))
}

/// Memoizes existence checks so a sample with many transactions against the
/// same order or account costs one lookup per referenced document.
struct ReferenceCache<'a> {
    stores: &'a Stores,
    orders: HashMap<String, bool>,
    customers: HashMap<String, bool>,
    accounts: HashMap<String, bool>,
}

impl<'a> ReferenceCache<'a> {
    fn new(stores: &'a Stores) -> Self {
        Self {
            stores,
            orders: HashMap::new(),
            customers: HashMap::new(),
            accounts: HashMap::new(),
        }
    }

    async fn order(&mut self, id: &str) -> Result<bool> {
        if let Some(live) = self.orders.get(id) {
            return Ok(*live);
        }
        let live = self
            .stores
            .orders
            .get(id)
            .await?
            .is_some_and(|o| !o.is_deleted);
        self.orders.insert(id.to_string(), live);
        Ok(live)
    }

    async fn customer(&mut self, id: &str) -> Result<bool> {
        if let Some(live) = self.customers.get(id) {
            return Ok(*live);
        }
        let live = self
            .stores
            .customers
            .get(id)
            .await?
            .is_some_and(|c| !c.is_deleted);
        self.customers.insert(id.to_string(), live);
        Ok(live)
    }

    async fn account(&mut self, code: &str) -> Result<bool> {
        if let Some(live) = self.accounts.get(code) {
            return Ok(*live);
        }
        let live = self
            .stores
            .accounts
            .get(code)
            .await?
            .is_some_and(|a| !a.is_deleted);
        self.accounts.insert(code.to_string(), live);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{AccountType, LedgerAccount};
    use crate::domain::customer::{Customer, CustomerTransaction};
    use crate::domain::payment::PaymentStatus;
    use crate::domain::transaction::{Transaction, TransactionType};

    fn transaction(id: &str, number: &str, debit: Decimal, credit: Decimal) -> Transaction {
        Transaction {
            id: id.to_string(),
            transaction_id: number.to_string(),
            r#type: TransactionType::Sale,
            payment_id: format!("pay-{id}"),
            refund_id: None,
            order_id: None,
            customer_id: None,
            amount: debit.max(credit),
            currency: "USD".to_string(),
            account_code: "1000".to_string(),
            debit_amount: debit,
            credit_amount: credit,
            status: PaymentStatus::Completed,
            gateway: "manual".to_string(),
            external_transaction_id: None,
            fees: Default::default(),
            reason: None,
            error: None,
            ledger_posted: true,
            is_deleted: false,
            created_at: Utc::now(),
            completed_at: None,
            version: 0,
        }
    }

    fn entry(id: &str, customer_id: &str, impact: Decimal) -> CustomerTransaction {
        CustomerTransaction {
            id: id.to_string(),
            transaction_number: format!("CT-{id}"),
            customer_id: customer_id.to_string(),
            transaction_type: "invoice".to_string(),
            transaction_date: Utc::now(),
            description: None,
            balance_impact: Balance::new(impact),
            affects_pending_balance: true,
            affects_advance_balance: false,
            order_id: None,
            is_deleted: false,
            version: 0,
        }
    }

    async fn consistent() -> (Stores, LedgerValidator) {
        let stores = Stores::in_memory();
        let mut cash = LedgerAccount::new("1000", "Cash", AccountType::Asset);
        cash.current_balance = Balance::new(dec!(70.00));
        stores.accounts.insert(cash).await.unwrap();
        stores
            .transactions
            .insert(transaction("tx-1", "TXN-1", dec!(100.00), dec!(0)))
            .await
            .unwrap();
        stores
            .transactions
            .insert(transaction("tx-2", "TXN-2", dec!(0), dec!(30.00)))
            .await
            .unwrap();

        stores
            .customers
            .insert(Customer {
                id: "cus-1".to_string(),
                name: "Ada".to_string(),
                pending_balance: Balance::new(dec!(150.00)),
                advance_balance: Balance::ZERO,
                is_deleted: false,
                balance_reconciled_at: None,
                version: 0,
            })
            .await
            .unwrap();
        stores
            .customer_transactions
            .insert(entry("ct-1", "cus-1", dec!(200.00)))
            .await
            .unwrap();
        stores
            .customer_transactions
            .insert(entry("ct-2", "cus-1", dec!(-50.00)))
            .await
            .unwrap();

        stores
            .products
            .insert(Product {
                id: "prd-1".to_string(),
                name: "Widget".to_string(),
                sku: None,
                current_stock: 10,
                is_active: true,
                is_deleted: false,
                version: 0,
            })
            .await
            .unwrap();
        stores
            .inventory
            .insert(InventoryRecord {
                product_id: "prd-1".to_string(),
                current_stock: 10,
                reserved_stock: 4,
                available_stock: 6,
                version: 0,
            })
            .await
            .unwrap();

        let settings = Settings {
            audit_page_size: 1,
            ..Settings::default()
        };
        let validator = LedgerValidator::new(stores.clone(), Arc::new(settings));
        (stores, validator)
    }

    #[tokio::test]
    async fn test_consistent_dataset_is_clean() {
        let (_, validator) = consistent().await;
        let report = validator.run_all_validations().await.unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
        assert_eq!(report.total_issues, 0);
    }

    #[tokio::test]
    async fn test_mutated_debit_is_one_discrepancy() {
        let (stores, validator) = consistent().await;
        let mut tx = stores.transactions.get("tx-1").await.unwrap().unwrap();
        tx.debit_amount = dec!(250.00);
        stores.transactions.update(tx).await.unwrap();

        let issues = validator.check_double_entry().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::High);
        match &issues[0].details {
            IssueDetails::DoubleEntry {
                expected_balance,
                stored_balance,
                transaction_count,
                ..
            } => {
                assert_eq!(*expected_balance, Balance::new(dec!(220.00)));
                assert_eq!(*stored_balance, Balance::new(dec!(70.00)));
                assert_eq!(*transaction_count, 2);
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsettled_transactions_do_not_count() {
        let (stores, validator) = consistent().await;
        let mut pending = transaction("tx-3", "TXN-3", dec!(500.00), dec!(0));
        pending.status = PaymentStatus::Pending;
        pending.ledger_posted = false;
        stores.transactions.insert(pending).await.unwrap();
        assert!(validator.check_double_entry().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_transaction_number_reports_both_ids() {
        let (stores, validator) = consistent().await;
        stores
            .transactions
            .insert(transaction("tx-9", "TXN-1", dec!(0), dec!(0)))
            .await
            .unwrap();

        let issues = validator.check_duplicates().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::DuplicateTransaction);
        assert_eq!(
            issues[0].details,
            IssueDetails::Duplicate {
                key: "TXN-1".to_string(),
                ids: vec!["tx-1".to_string(), "tx-9".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_orphaned_account_reference() {
        let (stores, validator) = consistent().await;
        let mut stray = transaction("tx-5", "TXN-5", dec!(0), dec!(0));
        stray.account_code = "9999".to_string();
        stray.customer_id = Some("cus-1".to_string());
        stores.transactions.insert(stray).await.unwrap();

        let issues = validator.check_referential_integrity().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::OrphanedAccount);
        assert_eq!(issues[0].entity_id, "tx-5");
    }

    #[tokio::test]
    async fn test_customer_balance_mismatch() {
        let (stores, validator) = consistent().await;
        stores
            .customer_transactions
            .insert(entry("ct-3", "cus-1", dec!(25.00)))
            .await
            .unwrap();
        let issues = validator.check_customer_balances().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_fix_issues_repairs_stock_and_skips_ledger() {
        let (stores, validator) = consistent().await;
        let mut record = stores.inventory.get("prd-1").await.unwrap().unwrap();
        record.current_stock = 12;
        stores.inventory.update(record).await.unwrap();
        let mut tx = stores.transactions.get("tx-2").await.unwrap().unwrap();
        tx.credit_amount = dec!(35.00);
        stores.transactions.update(tx).await.unwrap();

        let report = validator.run_all_validations().await.unwrap();
        let kinds: Vec<IssueKind> = report.issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::StockSyncMismatch));
        assert!(kinds.contains(&IssueKind::IncorrectAvailableStock));
        assert!(kinds.contains(&IssueKind::DoubleEntryMismatch));

        let fixes = validator.fix_issues(&report.issues).await.unwrap();
        assert_eq!(fixes.fixed, 2);
        assert_eq!(fixes.skipped, 1);
        assert_eq!(fixes.failed, 0);

        let product = stores.products.get("prd-1").await.unwrap().unwrap();
        let record = stores.inventory.get("prd-1").await.unwrap().unwrap();
        assert_eq!(product.current_stock, 12);
        assert_eq!(record.current_stock, 12);
        assert_eq!(record.available_stock, 8);
        assert!(validator.check_inventory().await.unwrap().is_empty());

        let audit = stores.audit_log.page(None, 10).await.unwrap();
        assert_eq!(audit.len(), 3);
    }
}
