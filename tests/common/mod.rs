#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ledgerguard::application::orchestrator::{PaymentOrchestrator, ProcessPaymentRequest};
use ledgerguard::config::Settings;
use ledgerguard::domain::account::{AccountType, LedgerAccount};
use ledgerguard::domain::gateway::{
    ChargeRequest, GatewayError, GatewayErrorCode, GatewayRegistry, GatewayResult, Lookup,
    PaymentGateway, RefundRequest, VoidRequest,
};
use ledgerguard::domain::money::Balance;
use ledgerguard::domain::order::{Order, OrderPaymentStatus};
use ledgerguard::domain::payment::{CardInput, FeeBreakdown, Metadata, PaymentMethod};
use ledgerguard::domain::ports::Stores;
use ledgerguard::infrastructure::gateways::ManualGateway;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SCRIPTED: &str = "scripted";

/// What the scripted gateway answers to the next call.
#[derive(Debug, Clone)]
pub enum Step {
    Complete,
    Pending,
    Decline(GatewayErrorCode),
    Timeout,
}

/// Gateway whose answers are queued by the test. An empty queue completes.
/// Completed and pending answers are remembered for lookups.
#[derive(Default)]
pub struct ScriptedGateway {
    charges: Mutex<VecDeque<Step>>,
    refunds: Mutex<VecDeque<Step>>,
    voids: Mutex<VecDeque<Step>>,
    journal: Mutex<HashMap<String, GatewayResult>>,
    pub charge_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
    pub void_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_charges(&self, steps: impl IntoIterator<Item = Step>) {
        self.charges.lock().unwrap().extend(steps);
    }

    pub fn script_refunds(&self, steps: impl IntoIterator<Item = Step>) {
        self.refunds.lock().unwrap().extend(steps);
    }

    pub fn script_voids(&self, steps: impl IntoIterator<Item = Step>) {
        self.voids.lock().unwrap().extend(steps);
    }

    /// Pretends the processor settled `correlation_id` out of band.
    pub fn settle_out_of_band(&self, correlation_id: &str, amount: Decimal) {
        self.journal.lock().unwrap().insert(
            correlation_id.to_string(),
            GatewayResult::completed(
                format!("ext_{correlation_id}"),
                FeeBreakdown::card_rate(amount),
                serde_json::json!({ "source": "lookup" }),
            ),
        );
    }

    fn answer(
        &self,
        queue: &Mutex<VecDeque<Step>>,
        correlation_id: &str,
        amount: Decimal,
    ) -> Result<GatewayResult, GatewayError> {
        let step = queue.lock().unwrap().pop_front().unwrap_or(Step::Complete);
        let fees = FeeBreakdown::card_rate(amount);
        let raw = serde_json::json!({ "id": correlation_id, "step": format!("{step:?}") });
        let result = match step {
            Step::Complete => GatewayResult::completed(format!("ext_{correlation_id}"), fees, raw),
            Step::Pending => GatewayResult::pending(format!("ext_{correlation_id}"), fees, raw),
            Step::Decline(code) => GatewayResult::declined(code, "scripted decline", raw),
            Step::Timeout => return Err(GatewayError::Timeout),
        };
        if result.success {
            self.journal
                .lock()
                .unwrap()
                .insert(correlation_id.to_string(), result.clone());
        }
        Ok(result)
    }

    fn find(&self, correlation_id: &str) -> Lookup {
        match self.journal.lock().unwrap().get(correlation_id) {
            Some(result) => Lookup::Found(result.clone()),
            None => Lookup::NotFound,
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &str {
        SCRIPTED
    }

    fn supported_methods(&self) -> &[PaymentMethod] {
        &[PaymentMethod::CreditCard, PaymentMethod::Cash]
    }

    fn validate_payment_method(&self, _request: &ChargeRequest) -> Result<(), GatewayErrorCode> {
        Ok(())
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<GatewayResult, GatewayError> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.charges, &request.correlation_id, request.amount.value())
    }

    async fn process_refund(&self, request: &RefundRequest) -> Result<GatewayResult, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.refunds, &request.correlation_id, request.amount.value())
    }

    async fn process_void(&self, request: &VoidRequest) -> Result<GatewayResult, GatewayError> {
        self.void_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.voids, &request.correlation_id, Decimal::ZERO)
    }

    async fn lookup(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        Ok(self.find(correlation_id))
    }

    async fn lookup_refund(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        Ok(self.find(correlation_id))
    }

    async fn lookup_void(&self, correlation_id: &str) -> Result<Lookup, GatewayError> {
        Ok(self.find(correlation_id))
    }
}

pub fn fast_settings() -> Arc<Settings> {
    Arc::new(Settings {
        retry_backoff_ms: 1,
        manual_gateway_delay_ms: 0,
        ..Settings::default()
    })
}

/// Cash and card clearing accounts plus one unpaid order `ord-1` of `total`.
pub async fn seeded_stores(total: Decimal) -> Stores {
    let stores = Stores::in_memory();
    for (code, name) in [("1000", "Cash"), ("1100", "Card Clearing")] {
        stores
            .accounts
            .insert(LedgerAccount::new(code, name, AccountType::Asset))
            .await
            .unwrap();
    }
    stores
        .orders
        .insert(Order {
            id: "ord-1".to_string(),
            order_number: "SO-0001".to_string(),
            customer_id: None,
            total,
            payment_status: OrderPaymentStatus::Unpaid,
            is_deleted: false,
            created_at: Utc::now(),
            version: 0,
        })
        .await
        .unwrap();
    stores
}

pub fn registry(scripted: Arc<ScriptedGateway>) -> GatewayRegistry {
    GatewayRegistry::new()
        .with(Arc::new(ManualGateway::new(Duration::ZERO)))
        .with(scripted)
}

pub fn orchestrator(stores: &Stores, scripted: Arc<ScriptedGateway>) -> PaymentOrchestrator {
    PaymentOrchestrator::new(stores.clone(), registry(scripted), fast_settings())
}

pub fn cash_payment(amount: Decimal) -> ProcessPaymentRequest {
    ProcessPaymentRequest {
        order_id: "ord-1".to_string(),
        method: PaymentMethod::Cash,
        amount,
        currency: "USD".to_string(),
        gateway: "manual".to_string(),
        card: None,
        wallet: None,
        metadata: Metadata::new(),
    }
}

pub fn card_payment(amount: Decimal) -> ProcessPaymentRequest {
    ProcessPaymentRequest {
        method: PaymentMethod::CreditCard,
        gateway: SCRIPTED.to_string(),
        card: Some(CardInput {
            number: "4242424242424242".to_string(),
            exp_month: 12,
            exp_year: 2099,
            cvc: Some("123".to_string()),
            ..Default::default()
        }),
        ..cash_payment(amount)
    }
}

pub async fn balance(stores: &Stores, code: &str) -> Balance {
    stores
        .accounts
        .get(code)
        .await
        .unwrap()
        .unwrap()
        .current_balance
}
