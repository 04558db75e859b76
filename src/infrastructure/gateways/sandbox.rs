use crate::domain::gateway::{
    ChargeRequest, GatewayError, GatewayErrorCode, GatewayResult, Lookup, PaymentGateway,
    RefundRequest, VoidRequest,
};
use crate::domain::payment::{FeeBreakdown, PaymentMethod};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub const NAME: &str = "sandbox";

const SUPPORTED: &[PaymentMethod] = &[
    PaymentMethod::CreditCard,
    PaymentMethod::DebitCard,
    PaymentMethod::DigitalWallet,
];

/// Payment token that makes the sandbox fail at the transport level.
pub const TIMEOUT_TOKEN: &str = "tok_timeout";
/// Payment token that makes the sandbox answer `pending`.
pub const PENDING_TOKEN: &str = "tok_pending";
/// Payment token that makes the sandbox decline.
pub const DECLINE_TOKEN: &str = "tok_decline";

/// Deterministic test-mode card processor.
///
/// Outcomes are driven by the last four digits of the card number:
///
/// | last4  | outcome              |
/// |--------|----------------------|
/// | `0002` | `card_declined`      |
/// | `9995` | `insufficient_funds` |
/// | `0069` | `expired_card`       |
/// | `0127` | `incorrect_cvc`      |
/// | `0119` | `processing_error`   |
///
/// and by the card or wallet token ([`TIMEOUT_TOKEN`], [`PENDING_TOKEN`],
/// [`DECLINE_TOKEN`]). Everything else completes at card rates.
#[derive(Default)]
pub struct SandboxGateway {
    journal: Mutex<HashMap<String, GatewayResult>>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, correlation_id: &str, result: &GatewayResult) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.insert(correlation_id.to_string(), result.clone());
        }
    }

    fn token(request: &ChargeRequest) -> Option<&str> {
        request
            .card
            .as_ref()
            .and_then(|c| c.token.as_deref())
            .or(request.wallet.as_ref().map(|w| w.token.as_str()))
    }

    fn decline_for(request: &ChargeRequest) -> Option<GatewayErrorCode> {
        if Self::token(request) == Some(DECLINE_TOKEN) {
            return Some(GatewayErrorCode::CardDeclined);
        }
        let card = request.card.as_ref()?;
        match card.last4().as_str() {
            "0002" => Some(GatewayErrorCode::CardDeclined),
            "9995" => Some(GatewayErrorCode::InsufficientFunds),
            "0069" => Some(GatewayErrorCode::ExpiredCard),
            "0127" => Some(GatewayErrorCode::IncorrectCvc),
            "0119" => Some(GatewayErrorCode::ProcessingError),
            _ if card.is_expired(Utc::now()) => Some(GatewayErrorCode::ExpiredCard),
            _ => None,
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_methods(&self) -> &[PaymentMethod] {
        SUPPORTED
    }

    fn validate_payment_method(&self, request: &ChargeRequest) -> Result<(), GatewayErrorCode> {
        match request.method {
            PaymentMethod::CreditCard | PaymentMethod::DebitCard => {
                let card = request
                    .card
                    .as_ref()
                    .ok_or(GatewayErrorCode::InvalidPaymentMethod)?;
                let digits = card.number.chars().filter(char::is_ascii_digit).count();
                if !(12..=19).contains(&digits) || !(1..=12).contains(&card.exp_month) {
                    return Err(GatewayErrorCode::InvalidPaymentMethod);
                }
                Ok(())
            }
            PaymentMethod::DigitalWallet => match &request.wallet {
                Some(wallet) if !wallet.token.is_empty() => Ok(()),
                _ => Err(GatewayErrorCode::InvalidPaymentMethod),
            },
            _ => Err(GatewayErrorCode::InvalidPaymentMethod),
        }
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<GatewayResult, GatewayError> {
        if Self::token(request) == Some(TIMEOUT_TOKEN) {
            return Err(GatewayError::Timeout);
        }

        let id = format!("sbx_ch_{}", Uuid::new_v4().simple());
        let amount = request.amount.value();
        let raw = json!({
            "id": id,
            "amount": request.amount.minor_units(),
            "currency": request.currency.to_lowercase(),
        });
        let result = match Self::decline_for(request) {
            Some(code) => {
                let message = format!("sandbox decline: {code}");
                GatewayResult::declined(code, message, raw).with_external_id(id)
            }
            None if Self::token(request) == Some(PENDING_TOKEN) => {
                GatewayResult::pending(id, FeeBreakdown::card_rate(amount), raw)
            }
            None => GatewayResult::completed(id, FeeBreakdown::card_rate(amount), raw),
        };
        self.record(&request.correlation_id, &result);
        Ok(result)
    }

    async fn process_refund(&self, request: &RefundRequest) -> Result<GatewayResult, GatewayError> {
        let id = format!("sbx_re_{}", Uuid::new_v4().simple());
        let result = GatewayResult::completed(
            id.clone(),
            FeeBreakdown::none(request.amount.value()),
            json!({
                "id": id,
                "charge": request.external_transaction_id,
                "amount": request.amount.minor_units(),
            }),
        );
        self.record(&request.correlation_id, &result);
        Ok(result)
    }

    async fn process_void(&self, request: &VoidRequest) -> Result<GatewayResult, GatewayError> {
        let result = GatewayResult::completed(
            request.external_transaction_id.clone(),
            FeeBreakdown::default(),
            json!({ "id": request.external_transaction_id, "status": "canceled" }),
        );
        self.record(&request.correlation_id, &result);
        Ok(result)
    }

    async fn lookup(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        let journal = self
            .journal
            .lock()
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok(journal
            .get(correlation_id)
            .cloned()
            .map_or(Lookup::NotFound, Lookup::Found))
    }

    async fn lookup_refund(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        self.lookup(correlation_id).await
    }

    async fn lookup_void(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        self.lookup(correlation_id).await
    }
}
