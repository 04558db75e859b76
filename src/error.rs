use crate::domain::gateway::{GatewayError, GatewayErrorCode};
use crate::domain::payment::PaymentStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Coarse classification of a [`PaymentError`], used by callers to decide
/// whether to retry, surface a 404, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    GatewayTransport,
    GatewayDeclined,
    ConcurrencyConflict,
    Fatal,
}

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Invalid amount: {0} (must be greater than zero)")]
    InvalidAmount(Decimal),
    #[error("Order {0} is already fully paid")]
    AlreadyPaid(String),
    #[error("Payment {0} cannot be refunded in its current state")]
    NotRefundable(String),
    #[error("Refund of {requested} exceeds remaining refundable amount {remaining}")]
    RefundExceedsRemaining {
        requested: Decimal,
        remaining: Decimal,
    },
    #[error("Transaction {0} cannot be voided")]
    NotVoidable(String),
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    #[error("Unknown gateway: {0}")]
    UnknownGateway(String),
    #[error("Gateway {gateway} does not support {method}")]
    UnsupportedMethod { gateway: String, method: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Customer not found: {0}")]
    CustomerNotFound(String),
    #[error("Ledger account not found: {0}")]
    AccountNotFound(String),

    #[error("Gateway transport error for {reference} after {attempts} attempt(s): {source}")]
    GatewayTransport {
        reference: String,
        attempts: u32,
        #[source]
        source: GatewayError,
    },
    #[error("Gateway declined {reference}: {code}: {message}")]
    GatewayDeclined {
        reference: String,
        code: GatewayErrorCode,
        message: String,
    },
    #[error("Concurrent modification of {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl PaymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::ValidationError(_)
            | PaymentError::InvalidAmount(_)
            | PaymentError::AlreadyPaid(_)
            | PaymentError::NotRefundable(_)
            | PaymentError::RefundExceedsRemaining { .. }
            | PaymentError::NotVoidable(_)
            | PaymentError::InvalidTransition { .. }
            | PaymentError::UnknownGateway(_)
            | PaymentError::UnsupportedMethod { .. } => ErrorKind::Validation,
            PaymentError::OrderNotFound(_)
            | PaymentError::PaymentNotFound(_)
            | PaymentError::TransactionNotFound(_)
            | PaymentError::CustomerNotFound(_)
            | PaymentError::AccountNotFound(_) => ErrorKind::NotFound,
            PaymentError::GatewayTransport { .. } => ErrorKind::GatewayTransport,
            PaymentError::GatewayDeclined { .. } => ErrorKind::GatewayDeclined,
            PaymentError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            _ => ErrorKind::Fatal,
        }
    }

    /// Transport failures and lost compare-and-set races may succeed on a
    /// later attempt; everything else is final for the given input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::GatewayTransport | ErrorKind::ConcurrencyConflict
        )
    }

    /// HTTP-equivalent status for the routing layer that wraps this crate.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::GatewayDeclined => 402,
            ErrorKind::ConcurrencyConflict => 409,
            ErrorKind::GatewayTransport => 502,
            ErrorKind::Fatal => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
