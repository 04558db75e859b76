mod common;

use chrono::{Duration, Utc};
use common::{
    ScriptedGateway, Step, balance, card_payment, fast_settings, orchestrator, registry, seeded_stores,
};
use ledgerguard::application::orchestrator::PaymentOrchestrator;
use ledgerguard::application::recovery::RecoverySweep;
use ledgerguard::domain::account::LedgerAccount;
use ledgerguard::domain::money::Balance;
use ledgerguard::domain::order::OrderPaymentStatus;
use ledgerguard::domain::payment::{Payment, PaymentStatus, RefundStatus};
use ledgerguard::domain::ports::Stores;
use ledgerguard::domain::transaction::{Transaction, TransactionType};
use ledgerguard::error::PaymentError;
use ledgerguard::infrastructure::in_memory::InMemoryCollection;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn sweep(stores: &Stores, gateway: Arc<ScriptedGateway>) -> RecoverySweep {
    RecoverySweep::new(orchestrator(stores, gateway), stores.clone(), fast_settings())
}

async fn only_payment(stores: &Stores) -> Payment {
    let mut all = stores.payments.find(&|_: &Payment| true).await.unwrap();
    assert_eq!(all.len(), 1);
    all.remove(0)
}

#[tokio::test]
async fn test_lost_answer_is_settled_from_gateway_log() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    gateway.script_charges([Step::Timeout, Step::Timeout, Step::Timeout]);
    let orchestrator = orchestrator(&stores, gateway.clone());
    let result = orchestrator.process_payment(card_payment(dec!(100.00))).await;
    assert!(matches!(result, Err(PaymentError::GatewayTransport { .. })));

    let stuck = only_payment(&stores).await;
    gateway.settle_out_of_band(&stuck.id, stuck.amount);

    let report = sweep(&stores, gateway.clone())
        .run_at(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(report.payments_examined, 1);
    assert_eq!(report.payments_resolved, 1);
    assert_eq!(report.not_dispatched, 0);
    assert!(report.unresolved.is_empty());

    let settled = only_payment(&stores).await;
    assert_eq!(settled.status, PaymentStatus::Completed);
    assert_eq!(settled.gateway.external_transaction_id, Some(format!("ext_{}", settled.id)));
    assert_eq!(balance(&stores, "1100").await, Balance::new(dec!(100.00)));
    let order = stores.orders.get("ord-1").await.unwrap().unwrap();
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
}

#[tokio::test]
async fn test_sweep_respects_grace_period() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    gateway.script_charges([Step::Timeout, Step::Timeout, Step::Timeout]);
    let orchestrator = orchestrator(&stores, gateway.clone());
    let _ = orchestrator.process_payment(card_payment(dec!(100.00))).await;

    let report = sweep(&stores, gateway).run().await.unwrap();
    assert_eq!(report.payments_examined, 0);
    assert_eq!(only_payment(&stores).await.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn test_never_dispatched_payment_is_failed_and_order_can_be_paid_again() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    gateway.script_charges([Step::Timeout, Step::Timeout, Step::Timeout]);
    let orchestrator = orchestrator(&stores, gateway.clone());
    let _ = orchestrator.process_payment(card_payment(dec!(100.00))).await;

    let report = sweep(&stores, gateway.clone())
        .run_at(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(report.not_dispatched, 1);

    let failed = only_payment(&stores).await;
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(failed.error.as_ref().unwrap().code, "not_dispatched");

    let retried = orchestrator.process_payment(card_payment(dec!(100.00))).await.unwrap();
    assert_eq!(retried.payment.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn test_pending_refund_is_completed_by_sweep() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    gateway.script_refunds([Step::Timeout, Step::Timeout, Step::Timeout]);
    let orchestrator = orchestrator(&stores, gateway.clone());
    let paid = orchestrator.process_payment(card_payment(dec!(100.00))).await.unwrap();
    let _ = orchestrator.process_refund(&paid.payment.id, dec!(25.00), "lost").await;

    let payment = stores.payments.get(&paid.payment.id).await.unwrap().unwrap();
    let refund_id = payment.refunds[0].id.clone();
    gateway.settle_out_of_band(&refund_id, dec!(25.00));

    let report = sweep(&stores, gateway)
        .run_at(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(report.refunds_examined, 1);
    assert_eq!(report.refunds_resolved, 1);

    let payment = stores.payments.get(&paid.payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::PartiallyRefunded);
    assert_eq!(payment.refunds[0].status, RefundStatus::Completed);
    assert_eq!(balance(&stores, "1100").await, Balance::new(dec!(75.00)));
}

#[tokio::test]
async fn test_undispatched_refund_releases_reservation() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    gateway.script_refunds([Step::Timeout, Step::Timeout, Step::Timeout]);
    let orchestrator = orchestrator(&stores, gateway.clone());
    let paid = orchestrator.process_payment(card_payment(dec!(100.00))).await.unwrap();
    let _ = orchestrator.process_refund(&paid.payment.id, dec!(25.00), "lost").await;

    let report = sweep(&stores, gateway)
        .run_at(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(report.not_dispatched, 1);

    let payment = stores.payments.get(&paid.payment.id).await.unwrap().unwrap();
    assert_eq!(payment.refunds[0].status, RefundStatus::Failed);
    assert_eq!(payment.refundable_amount(), dec!(100.00));
    assert_eq!(balance(&stores, "1100").await, Balance::new(dec!(100.00)));
}

async fn voids(stores: &Stores) -> usize {
    stores
        .transactions
        .find(&|t: &Transaction| t.r#type == TransactionType::Void)
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_void_interrupted_after_gateway_is_finished_by_sweep() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    let paid = orchestrator(&stores, gateway.clone())
        .process_payment(card_payment(dec!(100.00)))
        .await
        .unwrap();

    // The gateway voids, then the ledger account cannot be reached.
    let detached = Stores {
        accounts: Arc::new(InMemoryCollection::<LedgerAccount>::new()),
        ..stores.clone()
    };
    let cut_off = PaymentOrchestrator::new(detached, registry(gateway.clone()), fast_settings());
    let result = cut_off.void_transaction(&paid.transaction.id, "wrong card").await;
    assert!(matches!(result, Err(PaymentError::AccountNotFound(_))));
    assert_eq!(gateway.void_calls.load(Ordering::SeqCst), 1);

    let stuck = stores.payments.get(&paid.payment.id).await.unwrap().unwrap();
    assert!(stuck.void_requested);
    let live = orchestrator(&stores, gateway.clone());
    let refund = live.process_refund(&paid.payment.id, dec!(10.00), "blocked").await;
    assert!(matches!(refund, Err(PaymentError::NotRefundable(_))));

    let report = sweep(&stores, gateway.clone())
        .run_at(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!((report.voids_examined, report.voids_resolved), (1, 1));
    assert!(report.unresolved.is_empty());
    assert_eq!(gateway.void_calls.load(Ordering::SeqCst), 1);

    let payment = only_payment(&stores).await;
    assert_eq!(payment.status, PaymentStatus::Cancelled);
    assert!(!payment.void_requested);
    let sale = stores.transactions.get(&paid.transaction.id).await.unwrap().unwrap();
    assert_eq!(sale.status, PaymentStatus::Cancelled);
    assert!(!sale.ledger_posted);
    assert_eq!(balance(&stores, "1100").await, Balance::ZERO);
    assert_eq!(voids(&stores).await, 1);
    let order = stores.orders.get("ord-1").await.unwrap().unwrap();
    assert_eq!(order.payment_status, OrderPaymentStatus::Unpaid);

    let again = sweep(&stores, gateway).run_at(Utc::now() + Duration::minutes(10)).await.unwrap();
    assert_eq!(again.voids_examined, 0);
}

#[tokio::test]
async fn test_void_with_lost_answer_is_settled_from_gateway_log() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    gateway.script_voids([Step::Timeout, Step::Timeout, Step::Timeout]);
    let orchestrator = orchestrator(&stores, gateway.clone());
    let paid = orchestrator.process_payment(card_payment(dec!(100.00))).await.unwrap();

    let result = orchestrator.void_transaction(&paid.transaction.id, "duplicate").await;
    assert!(matches!(result, Err(PaymentError::GatewayTransport { .. })));
    let held = only_payment(&stores).await;
    assert_eq!(held.status, PaymentStatus::Completed);
    assert!(held.void_requested);
    assert_eq!(balance(&stores, "1100").await, Balance::new(dec!(100.00)));

    gateway.settle_out_of_band(&format!("void-{}", paid.payment.id), dec!(0));
    let report = sweep(&stores, gateway)
        .run_at(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(report.voids_resolved, 1);

    let payment = only_payment(&stores).await;
    assert_eq!(payment.status, PaymentStatus::Cancelled);
    assert_eq!(balance(&stores, "1100").await, Balance::ZERO);
    assert_eq!(voids(&stores).await, 1);
}

#[tokio::test]
async fn test_void_never_seen_by_gateway_releases_reservation() {
    let stores = seeded_stores(dec!(100.00)).await;
    let gateway = ScriptedGateway::new();
    gateway.script_voids([Step::Timeout, Step::Timeout, Step::Timeout]);
    let orchestrator = orchestrator(&stores, gateway.clone());
    let paid = orchestrator.process_payment(card_payment(dec!(100.00))).await.unwrap();
    let _ = orchestrator.void_transaction(&paid.transaction.id, "duplicate").await;

    let report = sweep(&stores, gateway)
        .run_at(Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(report.voids_resolved, 1);
    assert_eq!(report.not_dispatched, 1);

    let payment = only_payment(&stores).await;
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(!payment.void_requested);
    assert_eq!(voids(&stores).await, 0);

    let refund = orchestrator.process_refund(&paid.payment.id, dec!(10.00), "partial").await.unwrap();
    assert_eq!(refund.payment.status, PaymentStatus::PartiallyRefunded);
}
