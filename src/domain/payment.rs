use super::gateway::{GatewayResult, GatewayStatus};
use super::money::round_currency;
use super::risk::RiskAssessment;
use crate::error::PaymentError;
use crate::impl_document;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Metadata = BTreeMap<String, String>;

/// Lifecycle shared by payments and their ledger transactions.
///
/// ```text
/// pending -> processing -> completed | failed | cancelled
/// processing -> pending            (released after exhausted transport retries)
/// completed -> partially_refunded -> refunded
/// completed -> refunded | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    PartiallyRefunded,
    Refunded,
}

impl PaymentStatus {
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        !self.is_terminal()
            && matches!(
                (self, next),
                (Pending, Processing | Cancelled | Failed)
                    | (Processing, Completed | Failed | Cancelled | Pending)
                    | (Completed, PartiallyRefunded | Refunded | Cancelled)
                    | (PartiallyRefunded, PartiallyRefunded | Refunded)
            )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Refunded
        )
    }

    /// Money actually moved: the record counts toward ledger balances and
    /// order totals.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
        )
    }

    /// Waiting on a gateway answer.
    pub fn is_in_flight(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Applies `next` or reports the illegal transition.
    pub fn transition(&mut self, next: PaymentStatus) -> Result<(), PaymentError> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(PaymentError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    BankTransfer,
    StoreCredit,
    CreditCard,
    DebitCard,
    DigitalWallet,
}

impl PaymentMethod {
    pub fn is_card(self) -> bool {
        matches!(self, PaymentMethod::CreditCard | PaymentMethod::DebitCard)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Check => "check",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::StoreCredit => "store_credit",
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::DigitalWallet => "digital_wallet",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Card details as submitted by the caller.
///
/// Never persisted: [`CardInput::sanitize`] keeps only what may be stored.
#[derive(Clone, Default, Deserialize)]
pub struct CardInput {
    pub number: String,
    pub exp_month: u8,
    pub exp_year: u16,
    pub cvc: Option<String>,
    pub holder_name: Option<String>,
    pub billing_postal_code: Option<String>,
    pub billing_country: Option<String>,
    /// Processor-side payment method token, when the card was tokenized
    /// client-side.
    pub token: Option<String>,
}

impl fmt::Debug for CardInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardInput")
            .field("number", &format_args!("****{}", self.last4()))
            .field("exp_month", &self.exp_month)
            .field("exp_year", &self.exp_year)
            .field("cvc", &self.cvc.as_ref().map(|_| "***"))
            .field("token", &self.token)
            .finish()
    }
}

impl CardInput {
    fn digits(&self) -> String {
        self.number.chars().filter(|c| c.is_ascii_digit()).collect()
    }

    pub fn last4(&self) -> String {
        let digits = self.digits();
        digits[digits.len().saturating_sub(4)..].to_string()
    }

    pub fn brand(&self) -> CardBrand {
        let digits = self.digits();
        let prefix2: u32 = digits.get(..2).and_then(|p| p.parse().ok()).unwrap_or(0);
        if digits.starts_with('4') {
            CardBrand::Visa
        } else if (51..=55).contains(&prefix2) || digits.starts_with("22") {
            CardBrand::Mastercard
        } else if prefix2 == 34 || prefix2 == 37 {
            CardBrand::Amex
        } else if digits.starts_with("6011") || digits.starts_with("65") {
            CardBrand::Discover
        } else {
            CardBrand::Unknown
        }
    }

    pub fn sanitize(&self) -> StoredCard {
        StoredCard {
            last4: self.last4(),
            brand: self.brand(),
            exp_month: self.exp_month,
            exp_year: self.exp_year,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        use chrono::Datelike;
        let (year, month) = (now.year() as u16, now.month() as u8);
        self.exp_year < year || (self.exp_year == year && self.exp_month < month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardBrand {
    Visa,
    Mastercard,
    Amex,
    Discover,
    Unknown,
}

/// The only card data that is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCard {
    pub last4: String,
    pub brand: CardBrand,
    pub exp_month: u8,
    pub exp_year: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInput {
    /// e.g. "apple_pay", "google_pay", "paypal"
    pub provider: String,
    pub token: String,
}

/// Processing costs of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub processing_fee: Decimal,
    pub gateway_fee: Decimal,
    pub total_fee: Decimal,
    pub net_amount: Decimal,
}

impl FeeBreakdown {
    pub fn new(amount: Decimal, processing_fee: Decimal, gateway_fee: Decimal) -> Self {
        let processing_fee = round_currency(processing_fee);
        let gateway_fee = round_currency(gateway_fee);
        let total_fee = processing_fee + gateway_fee;
        Self {
            processing_fee,
            gateway_fee,
            total_fee,
            net_amount: amount - total_fee,
        }
    }

    pub fn none(amount: Decimal) -> Self {
        Self::new(amount, Decimal::ZERO, Decimal::ZERO)
    }

    /// Standard card-not-present pricing: 2.9% + 0.30.
    pub fn card_rate(amount: Decimal) -> Self {
        Self::new(amount, amount * dec!(0.029) + dec!(0.30), Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub amount: Decimal,
    pub reason: String,
    pub status: RefundStatus,
    pub external_refund_id: Option<String>,
    pub transaction_id: Option<String>,
    pub error: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Last failure recorded on a payment, refund or transaction, kept so a
/// recovery sweep can resume the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub retry_count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub name: String,
    pub external_transaction_id: Option<String>,
    #[serde(default)]
    pub raw_response: serde_json::Value,
}

/// One attempt to collect money for an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub order_id: String,
    pub customer_id: Option<String>,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub gateway: GatewayInfo,
    pub card: Option<StoredCard>,
    pub wallet_provider: Option<String>,
    #[serde(default)]
    pub fees: FeeBreakdown,
    #[serde(default)]
    pub refunds: Vec<Refund>,
    pub risk: RiskAssessment,
    pub error: Option<FailureInfo>,
    /// Set while a gateway void is in flight; refunds are refused meanwhile.
    #[serde(default)]
    pub void_requested: bool,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl_document!(Payment, "payments", id);

impl Payment {
    pub fn refunded_total(&self) -> Decimal {
        self.refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Completed)
            .map(|r| r.amount)
            .sum()
    }

    /// Completed plus in-flight refunds.
    pub fn reserved_refund_total(&self) -> Decimal {
        self.refunds
            .iter()
            .filter(|r| r.status != RefundStatus::Failed)
            .map(|r| r.amount)
            .sum()
    }

    /// `amount − Σ completed refunds`.
    pub fn remaining_amount(&self) -> Decimal {
        self.amount - self.refunded_total()
    }

    /// What a new refund may still claim, net of refunds already in flight.
    pub fn refundable_amount(&self) -> Decimal {
        self.amount - self.reserved_refund_total()
    }

    /// Money this payment contributes toward its order.
    pub fn net_collected(&self) -> Decimal {
        if self.status.is_settled() {
            self.remaining_amount()
        } else {
            Decimal::ZERO
        }
    }

    pub fn refund(&self, refund_id: &str) -> Option<&Refund> {
        self.refunds.iter().find(|r| r.id == refund_id)
    }

    pub fn refund_mut(&mut self, refund_id: &str) -> Option<&mut Refund> {
        self.refunds.iter_mut().find(|r| r.id == refund_id)
    }

    pub fn transition(&mut self, next: PaymentStatus) -> Result<(), PaymentError> {
        self.status.transition(next)?;
        self.updated_at = Utc::now();
        if next == PaymentStatus::Completed {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Writes a gateway answer onto the payment. A gateway `pending` keeps the
    /// payment in `processing` until a later callback or sweep settles it.
    pub fn apply_gateway_result(&mut self, result: &GatewayResult) -> Result<(), PaymentError> {
        if self.status == PaymentStatus::Pending {
            self.transition(PaymentStatus::Processing)?;
        }
        if result.external_transaction_id.is_some() {
            self.gateway.external_transaction_id = result.external_transaction_id.clone();
        }
        self.gateway.raw_response = result.raw_response.clone();
        self.fees = result.fees;
        match result.status {
            GatewayStatus::Completed => {
                self.error = None;
                self.transition(PaymentStatus::Completed)
            }
            GatewayStatus::Pending => {
                self.updated_at = Utc::now();
                Ok(())
            }
            GatewayStatus::Failed => {
                self.error = Some(result.failure_info(self.retry_count()));
                self.transition(PaymentStatus::Failed)
            }
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.error.as_ref().map(|e| e.retry_count).unwrap_or(0)
    }

    /// Re-derives the refund status from the refund list.
    pub fn refund_status(&self) -> PaymentStatus {
        if self.refunded_total() >= self.amount {
            PaymentStatus::Refunded
        } else if self.refunded_total() > Decimal::ZERO {
            PaymentStatus::PartiallyRefunded
        } else {
            self.status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::risk::RiskLevel;

    fn payment(amount: Decimal) -> Payment {
        let now = Utc::now();
        Payment {
            id: "pay-1".to_string(),
            order_id: "ord-1".to_string(),
            customer_id: None,
            method: PaymentMethod::Cash,
            amount,
            currency: "USD".to_string(),
            status: PaymentStatus::Completed,
            gateway: GatewayInfo {
                name: "manual".to_string(),
                ..Default::default()
            },
            card: None,
            wallet_provider: None,
            fees: FeeBreakdown::none(amount),
            refunds: Vec::new(),
            risk: RiskAssessment {
                score: 0,
                level: RiskLevel::Low,
                factors: Vec::new(),
            },
            error: None,
            void_requested: false,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
            version: 0,
        }
    }

    fn refund(id: &str, amount: Decimal, status: RefundStatus) -> Refund {
        Refund {
            id: id.to_string(),
            amount,
            reason: "test".to_string(),
            status,
            external_refund_id: None,
            transaction_id: None,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn test_status_machine_rejects_leaving_terminal_states() {
        use PaymentStatus::*;
        let all = [Pending, Processing, Completed, Failed, Cancelled, PartiallyRefunded, Refunded];
        for status in all {
            if status.is_terminal() {
                for next in all {
                    assert!(!status.can_transition_to(next), "{status} -> {next}");
                }
            }
        }
        assert!(!PartiallyRefunded.is_terminal());
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Completed.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(Refunded));
        assert!(Completed.can_transition_to(Cancelled));
        assert!(!PartiallyRefunded.can_transition_to(Cancelled));
    }

    #[test]
    fn test_transition_reports_illegal_move() {
        let mut status = PaymentStatus::Failed;
        let err = status.transition(PaymentStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            PaymentError::InvalidTransition {
                from: PaymentStatus::Failed,
                to: PaymentStatus::Completed
            }
        ));
        assert_eq!(status, PaymentStatus::Failed);
    }

    #[test]
    fn test_remaining_amount_ignores_pending_and_failed_refunds() {
        let mut p = payment(dec!(100.00));
        p.refunds.push(refund("r1", dec!(60.00), RefundStatus::Completed));
        p.refunds.push(refund("r2", dec!(10.00), RefundStatus::Pending));
        p.refunds.push(refund("r3", dec!(25.00), RefundStatus::Failed));

        assert_eq!(p.refunded_total(), dec!(60.00));
        assert_eq!(p.remaining_amount(), dec!(40.00));
        assert_eq!(p.refundable_amount(), dec!(30.00));
        assert_eq!(p.refund_status(), PaymentStatus::PartiallyRefunded);
    }

    #[test]
    fn test_fee_breakdown_derivation() {
        let fees = FeeBreakdown::card_rate(dec!(100.00));
        assert_eq!(fees.processing_fee, dec!(3.20));
        assert_eq!(fees.total_fee, dec!(3.20));
        assert_eq!(fees.net_amount, dec!(96.80));

        let none = FeeBreakdown::none(dec!(42.00));
        assert_eq!(none.total_fee, Decimal::ZERO);
        assert_eq!(none.net_amount, dec!(42.00));
    }

    #[test]
    fn test_card_sanitize_keeps_only_safe_fields() {
        let card = CardInput {
            number: "4242 4242 4242 4242".to_string(),
            exp_month: 12,
            exp_year: 2030,
            cvc: Some("123".to_string()),
            ..Default::default()
        };
        let stored = card.sanitize();
        assert_eq!(stored.last4, "4242");
        assert_eq!(stored.brand, CardBrand::Visa);

        let json = serde_json::to_string(&stored).unwrap();
        assert!(!json.contains("4242424242424242"));
        assert!(!json.contains("123"));

        let debug = format!("{card:?}");
        assert!(!debug.contains("4242 4242 4242 4242"));
        assert!(!debug.contains("\"123\""));
    }

    #[test]
    fn test_card_brand_detection() {
        let brand = |n: &str| {
            CardInput {
                number: n.to_string(),
                ..Default::default()
            }
            .brand()
        };
        assert_eq!(brand("5555555555554444"), CardBrand::Mastercard);
        assert_eq!(brand("378282246310005"), CardBrand::Amex);
        assert_eq!(brand("6011111111111117"), CardBrand::Discover);
        assert_eq!(brand("9999"), CardBrand::Unknown);
    }
}
