use super::account::{LedgerAccount, NormalSide};
use super::gateway::{GatewayResult, GatewayStatus};
use super::payment::{FailureInfo, FeeBreakdown, Payment, PaymentStatus, Refund};
use crate::error::PaymentError;
use crate::impl_document;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Sale,
    Refund,
    Void,
}

/// Ledger-facing mirror of a payment event, carrying the double-entry
/// posting against `account_code`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Transaction {
    /// Document id.
    pub id: String,
    /// Business transaction number; unique by convention, which the
    /// duplicate audit verifies.
    pub transaction_id: String,
    pub r#type: TransactionType,
    pub payment_id: String,
    pub refund_id: Option<String>,
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
    /// Signed: refunds are negative.
    pub amount: Decimal,
    pub currency: String,
    pub account_code: String,
    pub debit_amount: Decimal,
    pub credit_amount: Decimal,
    pub status: PaymentStatus,
    pub gateway: String,
    pub external_transaction_id: Option<String>,
    #[serde(default)]
    pub fees: FeeBreakdown,
    pub reason: Option<String>,
    pub error: Option<FailureInfo>,
    /// Whether `debit_amount`/`credit_amount` are reflected in the account's
    /// cached balance.
    #[serde(default)]
    pub ledger_posted: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl_document!(Transaction, "transactions", id);

fn transaction_number() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("TXN-{}-{}", Utc::now().format("%Y%m%d"), &id[..12].to_uppercase())
}

impl Transaction {
    /// Sale posting: the full amount on the account's normal side.
    pub fn sale(payment: &Payment, account: &LedgerAccount, order_customer: Option<String>) -> Self {
        let (debit_amount, credit_amount) = match account.account_type.normal_side() {
            NormalSide::Debit => (payment.amount, Decimal::ZERO),
            NormalSide::Credit => (Decimal::ZERO, payment.amount),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            transaction_id: transaction_number(),
            r#type: TransactionType::Sale,
            payment_id: payment.id.clone(),
            refund_id: None,
            order_id: Some(payment.order_id.clone()),
            customer_id: payment.customer_id.clone().or(order_customer),
            amount: payment.amount,
            currency: payment.currency.clone(),
            account_code: account.account_code.clone(),
            debit_amount,
            credit_amount,
            status: PaymentStatus::Pending,
            gateway: payment.gateway.name.clone(),
            external_transaction_id: None,
            fees: FeeBreakdown::default(),
            reason: None,
            error: None,
            ledger_posted: false,
            is_deleted: false,
            created_at: Utc::now(),
            completed_at: None,
            version: 0,
        }
    }

    /// Refund posting: negative amount, booked on the side opposite the
    /// original sale.
    pub fn refund(sale: &Transaction, refund: &Refund) -> Self {
        let (debit_amount, credit_amount) = if sale.debit_amount > Decimal::ZERO {
            (Decimal::ZERO, refund.amount)
        } else {
            (refund.amount, Decimal::ZERO)
        };
        Self {
            id: Uuid::new_v4().to_string(),
            transaction_id: transaction_number(),
            r#type: TransactionType::Refund,
            refund_id: Some(refund.id.clone()),
            amount: -refund.amount,
            debit_amount,
            credit_amount,
            status: PaymentStatus::Processing,
            external_transaction_id: None,
            fees: FeeBreakdown::default(),
            reason: Some(refund.reason.clone()),
            error: None,
            ledger_posted: false,
            created_at: Utc::now(),
            completed_at: None,
            version: 0,
            ..sale.clone()
        }
    }

    /// Audit record of a void. Carries no posting of its own: the void
    /// reverses the sale's posting instead.
    pub fn void(sale: &Transaction, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            transaction_id: transaction_number(),
            r#type: TransactionType::Void,
            refund_id: None,
            amount: -sale.amount,
            debit_amount: Decimal::ZERO,
            credit_amount: Decimal::ZERO,
            status: PaymentStatus::Completed,
            fees: FeeBreakdown::default(),
            reason: Some(reason.to_string()),
            error: None,
            ledger_posted: true,
            created_at: now,
            completed_at: Some(now),
            version: 0,
            ..sale.clone()
        }
    }

    /// Mirrors a gateway answer. Same rules as
    /// [`Payment::apply_gateway_result`].
    pub fn apply_gateway_result(&mut self, result: &GatewayResult) -> Result<(), PaymentError> {
        if self.status == PaymentStatus::Pending {
            self.transition(PaymentStatus::Processing)?;
        }
        if result.external_transaction_id.is_some() {
            self.external_transaction_id = result.external_transaction_id.clone();
        }
        self.fees = result.fees;
        match result.status {
            GatewayStatus::Completed => {
                self.error = None;
                self.transition(PaymentStatus::Completed)
            }
            GatewayStatus::Pending => Ok(()),
            GatewayStatus::Failed => {
                let retry_count = self.error.as_ref().map_or(0, |e| e.retry_count);
                self.error = Some(result.failure_info(retry_count));
                self.transition(PaymentStatus::Failed)
            }
        }
    }

    /// Whether this record moves an account balance.
    pub fn has_posting(&self) -> bool {
        !self.debit_amount.is_zero() || !self.credit_amount.is_zero()
    }

    pub fn transition(&mut self, next: PaymentStatus) -> Result<(), PaymentError> {
        self.status.transition(next)?;
        if next == PaymentStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Counts toward the double-entry audit.
    pub fn is_posted_status(&self) -> bool {
        !self.is_deleted && self.status.is_settled()
    }
}
