use super::money::Amount;
use super::payment::{CardInput, FailureInfo, FeeBreakdown, Metadata, PaymentMethod, WalletInput};
use crate::error::PaymentError;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Completed,
    Pending,
    Failed,
}

/// Taxonomy of expected (non-transport) gateway failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorCode {
    CardDeclined,
    InsufficientFunds,
    ExpiredCard,
    IncorrectCvc,
    InvalidPaymentMethod,
    ProcessingError,
    UnsupportedOperation,
    TransactionNotFound,
    /// The request never reached the gateway (found by the recovery sweep).
    NotDispatched,
    Other(String),
}

impl GatewayErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            GatewayErrorCode::CardDeclined => "card_declined",
            GatewayErrorCode::InsufficientFunds => "insufficient_funds",
            GatewayErrorCode::ExpiredCard => "expired_card",
            GatewayErrorCode::IncorrectCvc => "incorrect_cvc",
            GatewayErrorCode::InvalidPaymentMethod => "invalid_payment_method",
            GatewayErrorCode::ProcessingError => "processing_error",
            GatewayErrorCode::UnsupportedOperation => "unsupported_operation",
            GatewayErrorCode::TransactionNotFound => "transaction_not_found",
            GatewayErrorCode::NotDispatched => "not_dispatched",
            GatewayErrorCode::Other(code) => code,
        }
    }

    /// Maps a processor decline code onto the taxonomy.
    pub fn from_decline_code(code: &str) -> Self {
        match code {
            "card_declined" | "generic_decline" | "do_not_honor" | "fraudulent" | "lost_card"
            | "stolen_card" => GatewayErrorCode::CardDeclined,
            "insufficient_funds" => GatewayErrorCode::InsufficientFunds,
            "expired_card" => GatewayErrorCode::ExpiredCard,
            "incorrect_cvc" | "invalid_cvc" => GatewayErrorCode::IncorrectCvc,
            "incorrect_number" | "invalid_number" | "invalid_expiry_month"
            | "invalid_expiry_year" => GatewayErrorCode::InvalidPaymentMethod,
            "processing_error" => GatewayErrorCode::ProcessingError,
            other => GatewayErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for GatewayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure: the outcome at the processor is unknown, so the
/// caller may retry.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("gateway unavailable (HTTP {status})")]
    Unavailable { status: u16 },
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

/// Normalized answer of every gateway operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResult {
    pub success: bool,
    pub status: GatewayStatus,
    pub external_transaction_id: Option<String>,
    pub raw_response: serde_json::Value,
    pub fees: FeeBreakdown,
    pub error_code: Option<GatewayErrorCode>,
    pub error_message: Option<String>,
}

impl GatewayResult {
    pub fn completed(
        external_transaction_id: impl Into<String>,
        fees: FeeBreakdown,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            success: true,
            status: GatewayStatus::Completed,
            external_transaction_id: Some(external_transaction_id.into()),
            raw_response,
            fees,
            error_code: None,
            error_message: None,
        }
    }

    pub fn pending(
        external_transaction_id: impl Into<String>,
        fees: FeeBreakdown,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            status: GatewayStatus::Pending,
            ..Self::completed(external_transaction_id, fees, raw_response)
        }
    }

    pub fn declined(
        code: GatewayErrorCode,
        message: impl Into<String>,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            success: false,
            status: GatewayStatus::Failed,
            external_transaction_id: None,
            raw_response,
            fees: FeeBreakdown::default(),
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }

    pub fn with_external_id(mut self, external_transaction_id: impl Into<String>) -> Self {
        self.external_transaction_id = Some(external_transaction_id.into());
        self
    }

    pub fn decline_code(&self) -> GatewayErrorCode {
        self.error_code
            .clone()
            .unwrap_or(GatewayErrorCode::ProcessingError)
    }

    pub fn decline_message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "declined by gateway".to_string())
    }

    pub fn failure_info(&self, retry_count: u32) -> FailureInfo {
        FailureInfo {
            code: self.decline_code().to_string(),
            message: self.decline_message(),
            retryable: false,
            retry_count,
            last_attempt_at: Utc::now(),
        }
    }
}

/// A charge request, stripped of everything gateway-specific.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount: Amount,
    pub currency: String,
    pub method: PaymentMethod,
    pub card: Option<CardInput>,
    pub wallet: Option<WalletInput>,
    /// Our payment id; gateways use it as idempotency key and for lookups.
    pub correlation_id: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    /// External id of the original charge.
    pub external_transaction_id: String,
    pub amount: Amount,
    pub currency: String,
    pub reason: String,
    /// Our refund id.
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct VoidRequest {
    pub external_transaction_id: String,
    pub reason: String,
    pub correlation_id: String,
}

/// Answer of a gateway-side lookup by correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(GatewayResult),
    NotFound,
    /// The adapter cannot search its processor's transaction log.
    Unsupported,
}

/// Uniform interface to an external payment processor.
///
/// Expected failures (declines, insufficient funds) come back as
/// `Ok(GatewayResult { success: false, .. })`; `Err` is reserved for
/// transport problems where the outcome is unknown.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    fn supported_methods(&self) -> &[PaymentMethod];

    /// Cheap local check run before any record is created.
    fn validate_payment_method(&self, request: &ChargeRequest) -> Result<(), GatewayErrorCode>;

    async fn process_payment(&self, request: &ChargeRequest) -> Result<GatewayResult, GatewayError>;

    async fn process_refund(&self, request: &RefundRequest) -> Result<GatewayResult, GatewayError>;

    fn supports_void(&self) -> bool {
        true
    }

    async fn process_void(&self, request: &VoidRequest) -> Result<GatewayResult, GatewayError>;

    /// Searches the processor's log for a charge by its correlation id.
    async fn lookup(&self, _correlation_id: &str) -> Result<Lookup, GatewayError> {
        Ok(Lookup::Unsupported)
    }

    /// Same for a refund.
    async fn lookup_refund(&self, _correlation_id: &str) -> Result<Lookup, GatewayError> {
        Ok(Lookup::Unsupported)
    }

    /// Same for a void.
    async fn lookup_void(&self, _correlation_id: &str) -> Result<Lookup, GatewayError> {
        Ok(Lookup::Unsupported)
    }
}

pub type GatewayBox = Arc<dyn PaymentGateway>;

/// Adapters registered by name, selected per call by the caller-supplied
/// gateway name.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: BTreeMap<String, GatewayBox>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: GatewayBox) -> &mut Self {
        self.gateways.insert(gateway.name().to_string(), gateway);
        self
    }

    pub fn with(mut self, gateway: GatewayBox) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, name: &str) -> Result<GatewayBox, PaymentError> {
        self.gateways
            .get(name)
            .cloned()
            .ok_or_else(|| PaymentError::UnknownGateway(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.gateways.keys().map(String::as_str)
    }
}
