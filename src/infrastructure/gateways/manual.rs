use crate::domain::gateway::{
    ChargeRequest, GatewayError, GatewayErrorCode, GatewayResult, Lookup, PaymentGateway,
    RefundRequest, VoidRequest,
};
use crate::domain::payment::{FeeBreakdown, PaymentMethod};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub const NAME: &str = "manual";

const SUPPORTED: &[PaymentMethod] = &[
    PaymentMethod::Cash,
    PaymentMethod::Check,
    PaymentMethod::BankTransfer,
    PaymentMethod::StoreCredit,
];

/// Payments collected outside any processor (cash drawer, cheque, wire).
///
/// Always succeeds after a simulated processing delay. Results are journaled
/// in-process so [`PaymentGateway::lookup`] can answer for this process's
/// lifetime.
pub struct ManualGateway {
    delay: Duration,
    journal: Mutex<HashMap<String, GatewayResult>>,
}

impl ManualGateway {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            journal: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, correlation_id: &str, result: &GatewayResult) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.insert(correlation_id.to_string(), result.clone());
        }
    }
}

#[async_trait]
impl PaymentGateway for ManualGateway {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_methods(&self) -> &[PaymentMethod] {
        SUPPORTED
    }

    fn validate_payment_method(&self, request: &ChargeRequest) -> Result<(), GatewayErrorCode> {
        if SUPPORTED.contains(&request.method) {
            Ok(())
        } else {
            Err(GatewayErrorCode::InvalidPaymentMethod)
        }
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<GatewayResult, GatewayError> {
        tokio::time::sleep(self.delay).await;
        let id = format!("MAN-{}", Uuid::new_v4().simple());
        let amount = request.amount.value();
        let result = GatewayResult::completed(
            id.clone(),
            FeeBreakdown::none(amount),
            json!({
                "id": id,
                "method": request.method,
                "amount": amount,
                "currency": request.currency,
            }),
        );
        self.record(&request.correlation_id, &result);
        Ok(result)
    }

    async fn process_refund(&self, request: &RefundRequest) -> Result<GatewayResult, GatewayError> {
        tokio::time::sleep(self.delay).await;
        let id = format!("MRF-{}", Uuid::new_v4().simple());
        let amount = request.amount.value();
        let result = GatewayResult::completed(
            id.clone(),
            FeeBreakdown::none(amount),
            json!({
                "id": id,
                "original": request.external_transaction_id,
                "amount": amount,
                "reason": request.reason,
            }),
        );
        self.record(&request.correlation_id, &result);
        Ok(result)
    }

    async fn process_void(&self, request: &VoidRequest) -> Result<GatewayResult, GatewayError> {
        let result = GatewayResult::completed(
            request.external_transaction_id.clone(),
            FeeBreakdown::default(),
            json!({ "voided": request.external_transaction_id, "reason": request.reason }),
        );
        self.record(&request.correlation_id, &result);
        Ok(result)
    }

    async fn lookup(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        let journal = self
            .journal
            .lock()
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok(match journal.get(correlation_id) {
            Some(result) => Lookup::Found(result.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn lookup_refund(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        self.lookup(correlation_id).await
    }

    async fn lookup_void(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        self.lookup(correlation_id).await
    }
}
