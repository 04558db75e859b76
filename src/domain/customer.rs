use super::money::Balance;
use crate::impl_document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    /// Cached Σ `balance_impact` over entries flagged `affects_pending_balance`.
    #[serde(default)]
    pub pending_balance: Balance,
    /// Cached Σ `balance_impact` over entries flagged `affects_advance_balance`.
    #[serde(default)]
    pub advance_balance: Balance,
    #[serde(default)]
    pub is_deleted: bool,
    pub balance_reconciled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl_document!(Customer, "customers", id);

/// One entry of a customer's sub-ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerTransaction {
    pub id: String,
    pub transaction_number: String,
    pub customer_id: String,
    pub transaction_type: String,
    pub transaction_date: DateTime<Utc>,
    pub description: Option<String>,
    pub balance_impact: Balance,
    #[serde(default)]
    pub affects_pending_balance: bool,
    #[serde(default)]
    pub affects_advance_balance: bool,
    pub order_id: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub version: u64,
}

impl_document!(CustomerTransaction, "customer_transactions", id);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubLedgerBalances {
    pub pending_balance: Balance,
    pub advance_balance: Balance,
    pub entry_count: usize,
}

impl std::ops::AddAssign for SubLedgerBalances {
    fn add_assign(&mut self, rhs: Self) {
        self.pending_balance += rhs.pending_balance;
        self.advance_balance += rhs.advance_balance;
        self.entry_count += rhs.entry_count;
    }
}

/// Recomputes a customer's balances from their sub-ledger entries.
/// Soft-deleted entries do not count.
pub fn compute_customer_balances<'a>(
    entries: impl IntoIterator<Item = &'a CustomerTransaction>,
) -> SubLedgerBalances {
    entries
        .into_iter()
        .filter(|e| !e.is_deleted)
        .fold(SubLedgerBalances::default(), |mut acc, e| {
            if e.affects_pending_balance {
                acc.pending_balance += e.balance_impact;
            }
            if e.affects_advance_balance {
                acc.advance_balance += e.balance_impact;
            }
            acc.entry_count += 1;
            acc
        })
}
