//! Runtime configuration.
//!
//! Settings are read from environment variables with `envy`, after `dotenvy`
//! has loaded an optional `.env` file. Every field has a default, so an empty
//! environment yields a usable in-process setup with the `manual` and
//! `sandbox` gateways.

use crate::domain::money::DEFAULT_TOLERANCE;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

/// # Environment Variables
///
/// - `ENABLED_GATEWAYS`: comma-separated adapter names, defaults to `manual,sandbox`
/// - `STRIPE_SECRET_KEY`: required when `stripe` is enabled
/// - `STRIPE_API_BASE`: defaults to `https://api.stripe.com`
/// - `GATEWAY_TIMEOUT_SECS`, `MANUAL_GATEWAY_DELAY_MS`
/// - `MAX_GATEWAY_RETRIES`, `RETRY_BACKOFF_MS`, `MAX_CONFLICT_RETRIES`
/// - `RECONCILIATION_BATCH_SIZE`, `BALANCE_TOLERANCE`, `REFERENTIAL_SAMPLE_SIZE`, `AUDIT_PAGE_SIZE`
/// - `CASH_ACCOUNT_CODE`, `CARD_CLEARING_ACCOUNT_CODE`
/// - `RECOVERY_GRACE_SECS`
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_enabled_gateways")]
    pub enabled_gateways: Vec<String>,
    #[serde(default)]
    pub stripe_secret_key: Option<String>,
    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
    #[serde(default = "default_manual_gateway_delay_ms")]
    pub manual_gateway_delay_ms: u64,

    #[serde(default = "default_max_gateway_retries")]
    pub max_gateway_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    #[serde(default = "default_reconciliation_batch_size")]
    pub reconciliation_batch_size: usize,
    #[serde(default = "default_balance_tolerance")]
    pub balance_tolerance: Decimal,
    #[serde(default = "default_referential_sample_size")]
    pub referential_sample_size: usize,
    #[serde(default = "default_audit_page_size")]
    pub audit_page_size: usize,

    #[serde(default = "default_cash_account_code")]
    pub cash_account_code: String,
    #[serde(default = "default_card_clearing_account_code")]
    pub card_clearing_account_code: String,

    #[serde(default = "default_recovery_grace_secs")]
    pub recovery_grace_secs: i64,
}

fn default_enabled_gateways() -> Vec<String> {
    vec!["manual".to_string(), "sandbox".to_string()]
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    15
}

fn default_manual_gateway_delay_ms() -> u64 {
    100
}

fn default_max_gateway_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_reconciliation_batch_size() -> usize {
    100
}

fn default_balance_tolerance() -> Decimal {
    DEFAULT_TOLERANCE
}

fn default_referential_sample_size() -> usize {
    1000
}

fn default_audit_page_size() -> usize {
    500
}

fn default_cash_account_code() -> String {
    "1000".to_string()
}

fn default_card_clearing_account_code() -> String {
    "1100".to_string()
}

fn default_recovery_grace_secs() -> i64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled_gateways: default_enabled_gateways(),
            stripe_secret_key: None,
            stripe_api_base: default_stripe_api_base(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            manual_gateway_delay_ms: default_manual_gateway_delay_ms(),
            max_gateway_retries: default_max_gateway_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_conflict_retries: default_max_conflict_retries(),
            reconciliation_batch_size: default_reconciliation_batch_size(),
            balance_tolerance: default_balance_tolerance(),
            referential_sample_size: default_referential_sample_size(),
            audit_page_size: default_audit_page_size(),
            cash_account_code: default_cash_account_code(),
            card_clearing_account_code: default_card_clearing_account_code(),
            recovery_grace_secs: default_recovery_grace_secs(),
        }
    }
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Config`] if a variable cannot be parsed into
    /// its field type.
    pub fn from_env() -> Result<Self> {
        // Missing .env is fine.
        dotenvy::dotenv().ok();
        envy::from_env::<Settings>().map_err(|e| PaymentError::Config(e.to_string()))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn manual_gateway_delay(&self) -> Duration {
        Duration::from_millis(self.manual_gateway_delay_ms)
    }

    /// Backoff before retry number `attempt` (1-based): base, 2×base, 4×base…
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}
