use super::money::Balance;
use crate::impl_document;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

/// Side on which an account's balance grows.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NormalSide {
    Debit,
    Credit,
}

impl AccountType {
    pub fn normal_side(self) -> NormalSide {
        match self {
            AccountType::Asset | AccountType::Expense => NormalSide::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Revenue => {
                NormalSide::Credit
            }
        }
    }
}

/// Chart-of-accounts entry. `current_balance` is a cache over the completed
/// transactions that reference `account_code`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerAccount {
    pub account_code: String,
    pub name: String,
    pub account_type: AccountType,
    #[serde(default)]
    pub current_balance: Balance,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub version: u64,
}

fn default_active() -> bool {
    true
}

impl_document!(LedgerAccount, "accounts", account_code);

impl LedgerAccount {
    pub fn new(account_code: impl Into<String>, name: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            account_code: account_code.into(),
            name: name.into(),
            account_type,
            current_balance: Balance::ZERO,
            is_active: true,
            is_deleted: false,
            version: 0,
        }
    }

    /// Balance implied by the given debit and credit totals under this
    /// account's sign convention.
    pub fn expected_balance(&self, debits: Decimal, credits: Decimal) -> Balance {
        match self.account_type.normal_side() {
            NormalSide::Debit => Balance::new(debits - credits),
            NormalSide::Credit => Balance::new(credits - debits),
        }
    }

    /// Applies one posting to the cached balance.
    pub fn post(&mut self, debit: Decimal, credit: Decimal) {
        self.current_balance += self.expected_balance(debit, credit);
    }

    /// Undoes a previous [`post`](Self::post).
    pub fn reverse(&mut self, debit: Decimal, credit: Decimal) {
        self.current_balance -= self.expected_balance(debit, credit);
    }
}
