use super::posting::{post_transaction, unpost_transaction};
use super::retry::{dispatch_with_retry, update_with_retry};
use crate::config::Settings;
use crate::domain::gateway::{
    ChargeRequest, GatewayRegistry, GatewayResult, GatewayStatus, RefundRequest, VoidRequest,
};
use crate::domain::money::{Amount, normalize_currency};
use crate::domain::order::Order;
use crate::domain::payment::{
    CardInput, FailureInfo, GatewayInfo, Metadata, Payment, PaymentMethod, PaymentStatus, Refund,
    RefundStatus, WalletInput,
};
use crate::domain::ports::Stores;
use crate::domain::risk::{self, RiskInput};
use crate::domain::transaction::{Transaction, TransactionType};
use crate::error::{PaymentError, Result};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Caller input of [`PaymentOrchestrator::process_payment`].
#[derive(Debug, Clone)]
pub struct ProcessPaymentRequest {
    pub order_id: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub gateway: String,
    pub card: Option<CardInput>,
    pub wallet: Option<WalletInput>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub payment: Payment,
    pub transaction: Transaction,
    pub gateway_result: GatewayResult,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub payment: Payment,
    pub refund: Refund,
    pub refund_transaction: Transaction,
}

#[derive(Debug, Clone)]
pub struct VoidOutcome {
    pub transaction: Transaction,
    pub payment: Payment,
}

/// Correlation id under which a payment's void is sent to its gateway.
pub(crate) fn void_correlation_id(payment_id: &str) -> String {
    format!("void-{payment_id}")
}

/// Settles payments against orders through the registered gateways.
///
/// Every flow is create-then-confirm: records are persisted in `pending`
/// before the gateway is called, so a crash or a lost answer leaves a record
/// the recovery sweep can finish. Multi-record updates are written in the
/// order Transaction, Account, Payment, Order. No lock is held across a
/// gateway call; per-payment serialization relies on compare-and-set.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    stores: Stores,
    gateways: GatewayRegistry,
    settings: Arc<Settings>,
}

impl PaymentOrchestrator {
    pub fn new(stores: Stores, gateways: GatewayRegistry, settings: Arc<Settings>) -> Self {
        Self {
            stores,
            gateways,
            settings,
        }
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    fn max_conflicts(&self) -> u32 {
        self.settings.max_conflict_retries
    }

    fn account_code_for(&self, method: PaymentMethod) -> &str {
        if method.is_card() || method == PaymentMethod::DigitalWallet {
            &self.settings.card_clearing_account_code
        } else {
            &self.settings.cash_account_code
        }
    }

    /// Collects `amount` for an order through the named gateway.
    ///
    /// A decline is persisted as a `failed` payment and reported as
    /// [`PaymentError::GatewayDeclined`]. Exhausted transport retries leave the
    /// payment `pending` with a retryable error and report
    /// [`PaymentError::GatewayTransport`].
    #[instrument(skip_all, fields(order_id = %request.order_id, gateway = %request.gateway))]
    pub async fn process_payment(&self, request: ProcessPaymentRequest) -> Result<PaymentOutcome> {
        let order = self
            .stores
            .orders
            .get(&request.order_id)
            .await?
            .filter(|o| !o.is_deleted)
            .ok_or_else(|| PaymentError::OrderNotFound(request.order_id.clone()))?;
        let amount = Amount::new(request.amount)?;
        let currency = normalize_currency(&request.currency)?;

        let gateway = self.gateways.get(&request.gateway)?;
        if !gateway.supported_methods().contains(&request.method) {
            return Err(PaymentError::UnsupportedMethod {
                gateway: request.gateway.clone(),
                method: request.method.to_string(),
            });
        }

        let order_payments = self.payments_for_order(&order.id).await?;
        let total_paid: Decimal = order_payments.iter().map(Payment::net_collected).sum();
        if total_paid >= order.total {
            return Err(PaymentError::AlreadyPaid(order.id.clone()));
        }
        let an_hour_ago = Utc::now() - Duration::hours(1);
        let recent_failed_attempts = order_payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Failed && p.created_at > an_hour_ago)
            .count() as u32;

        let account_code = self.account_code_for(request.method);
        let account = self
            .stores
            .accounts
            .get(account_code)
            .await?
            .filter(|a| a.is_active && !a.is_deleted)
            .ok_or_else(|| PaymentError::AccountNotFound(account_code.to_string()))?;

        let payment_id = Uuid::new_v4().to_string();
        let charge = ChargeRequest {
            amount,
            currency: currency.clone(),
            method: request.method,
            card: request.card.clone(),
            wallet: request.wallet.clone(),
            correlation_id: payment_id.clone(),
            metadata: request.metadata.clone(),
        };
        gateway
            .validate_payment_method(&charge)
            .map_err(|code| PaymentError::ValidationError(format!("invalid payment method: {code}")))?;

        let assessment = risk::score(&RiskInput {
            amount: amount.value(),
            method: request.method,
            card: request.card.as_ref(),
            metadata: &request.metadata,
            recent_failed_attempts,
        });

        let now = Utc::now();
        let payment = Payment {
            id: payment_id.clone(),
            order_id: order.id.clone(),
            customer_id: order.customer_id.clone(),
            method: request.method,
            amount: amount.value(),
            currency,
            status: PaymentStatus::Pending,
            gateway: GatewayInfo {
                name: gateway.name().to_string(),
                ..Default::default()
            },
            card: request.card.as_ref().map(CardInput::sanitize),
            wallet_provider: request.wallet.as_ref().map(|w| w.provider.clone()),
            fees: Default::default(),
            refunds: Vec::new(),
            risk: assessment,
            error: None,
            void_requested: false,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        };
        let payment = self.stores.payments.insert(payment).await?;
        let sale = Transaction::sale(&payment, &account, order.customer_id.clone());
        let sale = self.stores.transactions.insert(sale).await?;
        info!(
            payment_id = %payment.id,
            transaction_id = %sale.id,
            amount = %payment.amount,
            risk_score = payment.risk.score,
            "payment created"
        );

        // Dispatch marker: from here on the gateway may have seen the request.
        self.mark_processing(&payment.id, &sale.id).await?;

        let dispatched = dispatch_with_retry(&self.settings, &payment.id, || {
            gateway.process_payment(&charge)
        })
        .await;

        match dispatched {
            Ok(result) => {
                let (payment, transaction) = self.settle_charge(&payment.id, &result).await?;
                if result.status == GatewayStatus::Failed {
                    return Err(PaymentError::GatewayDeclined {
                        reference: payment.id,
                        code: result.decline_code(),
                        message: result.decline_message(),
                    });
                }
                Ok(PaymentOutcome {
                    payment,
                    transaction,
                    gateway_result: result,
                })
            }
            Err(e) => {
                self.release_after_transport_error(&payment.id, &sale.id, &e)
                    .await?;
                Err(e)
            }
        }
    }

    async fn payments_for_order(&self, order_id: &str) -> Result<Vec<Payment>> {
        let order_id = order_id.to_string();
        self.stores
            .payments
            .find(&move |p: &Payment| p.order_id == order_id)
            .await
    }

    pub(crate) async fn sale_for_payment(&self, payment_id: &str) -> Result<Transaction> {
        let id = payment_id.to_string();
        self.stores
            .transactions
            .find(&move |t: &Transaction| {
                t.payment_id == id && t.r#type == TransactionType::Sale && !t.is_deleted
            })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PaymentError::TransactionNotFound(format!("sale of payment {payment_id}")))
    }

    async fn mark_processing(&self, payment_id: &str, transaction_id: &str) -> Result<()> {
        let max = self.max_conflicts();
        update_with_retry(
            self.stores.transactions.as_ref(),
            transaction_id,
            max,
            PaymentError::TransactionNotFound,
            |tx| tx.transition(PaymentStatus::Processing),
        )
        .await?;
        update_with_retry(
            self.stores.payments.as_ref(),
            payment_id,
            max,
            PaymentError::PaymentNotFound,
            |p| p.transition(PaymentStatus::Processing),
        )
        .await?;
        Ok(())
    }

    /// Records exhausted transport retries: both records go back to
    /// `pending` with a retryable error so the recovery sweep picks them up.
    async fn release_after_transport_error(
        &self,
        payment_id: &str,
        transaction_id: &str,
        error: &PaymentError,
    ) -> Result<()> {
        let attempts = match error {
            PaymentError::GatewayTransport { attempts, .. } => *attempts,
            _ => 1,
        };
        let failure = FailureInfo {
            code: "gateway_transport".to_string(),
            message: error.to_string(),
            retryable: true,
            retry_count: attempts,
            last_attempt_at: Utc::now(),
        };
        let max = self.max_conflicts();
        update_with_retry(
            self.stores.transactions.as_ref(),
            transaction_id,
            max,
            PaymentError::TransactionNotFound,
            |tx| {
                if tx.status == PaymentStatus::Processing {
                    tx.transition(PaymentStatus::Pending)?;
                }
                tx.error = Some(failure.clone());
                Ok(())
            },
        )
        .await?;
        update_with_retry(
            self.stores.payments.as_ref(),
            payment_id,
            max,
            PaymentError::PaymentNotFound,
            |p| {
                if p.status == PaymentStatus::Processing {
                    p.transition(PaymentStatus::Pending)?;
                }
                p.error = Some(failure.clone());
                p.updated_at = Utc::now();
                Ok(())
            },
        )
        .await?;
        warn!(payment_id, attempts, "payment left pending after transport failures");
        Ok(())
    }

    /// Writes a gateway charge answer onto the sale transaction, the ledger,
    /// the payment and the order, in that order.
    ///
    /// Shared by the live path and the recovery sweep. Applying an answer to a
    /// payment that is no longer in flight is a no-op.
    pub(crate) async fn settle_charge(
        &self,
        payment_id: &str,
        result: &GatewayResult,
    ) -> Result<(Payment, Transaction)> {
        let max = self.max_conflicts();
        let payment = self
            .stores
            .payments
            .get(payment_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.to_string()))?;
        let sale = self.sale_for_payment(payment_id).await?;
        if !payment.status.is_in_flight() {
            return Ok((payment, sale));
        }

        let transaction = if sale.status.is_in_flight() {
            post_transaction(&self.stores, max, &sale.id, |tx| {
                tx.apply_gateway_result(result)
            })
            .await?
        } else {
            sale
        };

        let (payment, ()) = update_with_retry(
            self.stores.payments.as_ref(),
            payment_id,
            max,
            PaymentError::PaymentNotFound,
            |p| {
                if p.status.is_in_flight() {
                    p.apply_gateway_result(result)?;
                }
                Ok(())
            },
        )
        .await?;

        match payment.status {
            PaymentStatus::Completed => {
                info!(payment_id, external_id = ?payment.gateway.external_transaction_id, "payment completed");
                self.refresh_order_status(&payment.order_id).await?;
            }
            PaymentStatus::Failed => {
                warn!(
                    payment_id,
                    code = ?result.error_code,
                    message = ?result.error_message,
                    "payment declined"
                );
            }
            status => info!(payment_id, %status, "payment awaiting gateway confirmation"),
        }
        Ok((payment, transaction))
    }

    /// Recomputes the order's aggregate payment status from its payments.
    pub async fn refresh_order_status(&self, order_id: &str) -> Result<Order> {
        let mut attempt = 0;
        loop {
            let net_paid: Decimal = self
                .payments_for_order(order_id)
                .await?
                .iter()
                .map(Payment::net_collected)
                .sum();
            let mut order = self
                .stores
                .orders
                .get(order_id)
                .await?
                .ok_or_else(|| PaymentError::OrderNotFound(order_id.to_string()))?;
            let status = order.payment_status_for(net_paid);
            if order.payment_status == status {
                return Ok(order);
            }
            order.payment_status = status;
            match self.stores.orders.update(order).await {
                Ok(order) => {
                    info!(order_id, status = ?order.payment_status, %net_paid, "order payment status updated");
                    return Ok(order);
                }
                Err(PaymentError::ConcurrencyConflict { .. }) if attempt < self.max_conflicts() => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refunds part or all of a settled payment.
    ///
    /// The refund is reserved on the payment (appended as `pending`) in the
    /// same compare-and-set that checks the remaining amount, so concurrent
    /// refunds can never exceed what was collected.
    #[instrument(skip(self, reason))]
    pub async fn process_refund(
        &self,
        payment_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<RefundOutcome> {
        let max = self.max_conflicts();
        let payment = self
            .stores
            .payments
            .get(payment_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.to_string()))?;
        let amount = Amount::new(amount)?;
        let external_id = payment
            .gateway
            .external_transaction_id
            .clone()
            .ok_or_else(|| PaymentError::NotRefundable(payment_id.to_string()))?;
        let gateway = self.gateways.get(&payment.gateway.name)?;
        let sale = self.sale_for_payment(payment_id).await?;

        let mut refund = Refund {
            id: Uuid::new_v4().to_string(),
            amount: amount.value(),
            reason: reason.to_string(),
            status: RefundStatus::Pending,
            external_refund_id: None,
            transaction_id: None,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        let refund_tx = Transaction::refund(&sale, &refund);
        refund.transaction_id = Some(refund_tx.id.clone());

        let (payment, ()) = update_with_retry(
            self.stores.payments.as_ref(),
            payment_id,
            max,
            PaymentError::PaymentNotFound,
            |p| {
                let refundable_status = matches!(
                    p.status,
                    PaymentStatus::Completed | PaymentStatus::PartiallyRefunded
                );
                if !refundable_status || p.void_requested || p.remaining_amount() <= Decimal::ZERO {
                    return Err(PaymentError::NotRefundable(p.id.clone()));
                }
                let remaining = p.refundable_amount();
                if amount.value() > remaining {
                    return Err(PaymentError::RefundExceedsRemaining {
                        requested: amount.value(),
                        remaining,
                    });
                }
                p.refunds.push(refund.clone());
                p.updated_at = Utc::now();
                Ok(())
            },
        )
        .await?;
        let refund_tx = self.stores.transactions.insert(refund_tx).await?;
        info!(
            refund_id = %refund.id,
            amount = %refund.amount,
            remaining = %payment.refundable_amount(),
            "refund reserved"
        );

        let request = RefundRequest {
            external_transaction_id: external_id,
            amount,
            currency: payment.currency.clone(),
            reason: reason.to_string(),
            correlation_id: refund.id.clone(),
        };
        let dispatched = dispatch_with_retry(&self.settings, &refund.id, || {
            gateway.process_refund(&request)
        })
        .await;

        match dispatched {
            Ok(result) => {
                let outcome = self.settle_refund(payment_id, &refund.id, &result).await?;
                if result.status == GatewayStatus::Failed {
                    return Err(PaymentError::GatewayDeclined {
                        reference: refund.id,
                        code: result.decline_code(),
                        message: result.decline_message(),
                    });
                }
                Ok(outcome)
            }
            Err(e) => {
                let attempts = match &e {
                    PaymentError::GatewayTransport { attempts, .. } => *attempts,
                    _ => 1,
                };
                let failure = FailureInfo {
                    code: "gateway_transport".to_string(),
                    message: e.to_string(),
                    retryable: true,
                    retry_count: attempts,
                    last_attempt_at: Utc::now(),
                };
                update_with_retry(
                    self.stores.transactions.as_ref(),
                    &refund_tx.id,
                    max,
                    PaymentError::TransactionNotFound,
                    |tx| {
                        tx.error = Some(failure.clone());
                        Ok(())
                    },
                )
                .await?;
                update_with_retry(
                    self.stores.payments.as_ref(),
                    payment_id,
                    max,
                    PaymentError::PaymentNotFound,
                    |p| {
                        if let Some(r) = p.refund_mut(&refund.id) {
                            r.error = Some(failure.clone());
                        }
                        Ok(())
                    },
                )
                .await?;
                warn!(refund_id = %refund.id, attempts, "refund left pending after transport failures");
                Err(e)
            }
        }
    }

    /// Writes a gateway refund answer onto the refund transaction, the ledger,
    /// the payment, the sale transaction and the order.
    ///
    /// Shared by the live path and the recovery sweep. A refund that is no
    /// longer pending is left as it is.
    pub(crate) async fn settle_refund(
        &self,
        payment_id: &str,
        refund_id: &str,
        result: &GatewayResult,
    ) -> Result<RefundOutcome> {
        let max = self.max_conflicts();
        let payment = self
            .stores
            .payments
            .get(payment_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.to_string()))?;
        let refund = payment
            .refund(refund_id)
            .cloned()
            .ok_or_else(|| PaymentError::ValidationError(format!("unknown refund {refund_id}")))?;
        let refund_tx = self.refund_transaction(&payment, &refund).await?;
        if refund.status != RefundStatus::Pending {
            return Ok(RefundOutcome {
                payment,
                refund,
                refund_transaction: refund_tx,
            });
        }

        let refund_tx = if refund_tx.status.is_in_flight() {
            post_transaction(&self.stores, max, &refund_tx.id, |tx| {
                if result.external_transaction_id.is_some() {
                    tx.external_transaction_id = result.external_transaction_id.clone();
                }
                match result.status {
                    GatewayStatus::Completed => {
                        tx.error = None;
                        tx.transition(PaymentStatus::Completed)
                    }
                    GatewayStatus::Pending => Ok(()),
                    GatewayStatus::Failed => {
                        tx.error = Some(result.failure_info(0));
                        tx.transition(PaymentStatus::Failed)
                    }
                }
            })
            .await?
        } else {
            refund_tx
        };

        let (payment, refund) = update_with_retry(
            self.stores.payments.as_ref(),
            payment_id,
            max,
            PaymentError::PaymentNotFound,
            |p| {
                let now = Utc::now();
                let retry_count = p.refund(refund_id).and_then(|r| r.error.as_ref()).map_or(0, |e| e.retry_count);
                let Some(r) = p.refund_mut(refund_id) else {
                    return Err(PaymentError::ValidationError(format!("unknown refund {refund_id}")));
                };
                if r.status != RefundStatus::Pending {
                    return Ok(r.clone());
                }
                if result.external_transaction_id.is_some() {
                    r.external_refund_id = result.external_transaction_id.clone();
                }
                match result.status {
                    GatewayStatus::Completed => {
                        r.status = RefundStatus::Completed;
                        r.error = None;
                        r.processed_at = Some(now);
                    }
                    GatewayStatus::Pending => {}
                    GatewayStatus::Failed => {
                        r.status = RefundStatus::Failed;
                        r.error = Some(result.failure_info(retry_count));
                        r.processed_at = Some(now);
                    }
                }
                let refund = r.clone();
                if refund.status == RefundStatus::Completed {
                    let next = p.refund_status();
                    p.transition(next)?;
                }
                p.updated_at = now;
                Ok(refund)
            },
        )
        .await?;

        match refund.status {
            RefundStatus::Completed => {
                let status = payment.status;
                update_with_retry(
                    self.stores.transactions.as_ref(),
                    &self.sale_for_payment(payment_id).await?.id,
                    max,
                    PaymentError::TransactionNotFound,
                    |sale| {
                        if sale.status != status && sale.status.can_transition_to(status) {
                            sale.transition(status)?;
                        }
                        Ok(())
                    },
                )
                .await?;
                info!(
                    payment_id,
                    refund_id,
                    amount = %refund.amount,
                    %status,
                    "refund completed"
                );
                self.refresh_order_status(&payment.order_id).await?;
            }
            RefundStatus::Failed => {
                warn!(payment_id, refund_id, code = ?result.error_code, "refund declined, reservation released");
            }
            RefundStatus::Pending => info!(payment_id, refund_id, "refund awaiting gateway confirmation"),
        }

        Ok(RefundOutcome {
            payment,
            refund,
            refund_transaction: refund_tx,
        })
    }

    /// Loads the refund's ledger transaction, recreating it if the process
    /// stopped between reserving the refund and writing the transaction.
    async fn refund_transaction(&self, payment: &Payment, refund: &Refund) -> Result<Transaction> {
        if let Some(id) = &refund.transaction_id
            && let Some(tx) = self.stores.transactions.get(id).await?
        {
            return Ok(tx);
        }
        let sale = self.sale_for_payment(&payment.id).await?;
        let mut tx = Transaction::refund(&sale, refund);
        if let Some(id) = &refund.transaction_id {
            tx.id = id.clone();
        }
        if refund.status == RefundStatus::Failed {
            tx.transition(PaymentStatus::Failed)?;
        }
        info!(refund_id = %refund.id, transaction_id = %tx.id, "refund transaction recreated");
        self.stores.transactions.insert(tx).await
    }

    /// Voids a completed sale: cancels it at the gateway when the adapter
    /// supports it, reverses its ledger posting and cancels the payment.
    #[instrument(skip(self, reason))]
    pub async fn void_transaction(&self, transaction_id: &str, reason: &str) -> Result<VoidOutcome> {
        let max = self.max_conflicts();
        let sale = self
            .stores
            .transactions
            .get(transaction_id)
            .await?
            .filter(|t| !t.is_deleted)
            .ok_or_else(|| PaymentError::TransactionNotFound(transaction_id.to_string()))?;
        if sale.r#type != TransactionType::Sale || sale.status != PaymentStatus::Completed {
            return Err(PaymentError::NotVoidable(transaction_id.to_string()));
        }
        let gateway = self.gateways.get(&sale.gateway)?;

        let (payment, ()) = update_with_retry(
            self.stores.payments.as_ref(),
            &sale.payment_id,
            max,
            PaymentError::PaymentNotFound,
            |p| {
                if p.status != PaymentStatus::Completed
                    || p.void_requested
                    || p.reserved_refund_total() > Decimal::ZERO
                {
                    return Err(PaymentError::NotVoidable(transaction_id.to_string()));
                }
                p.void_requested = true;
                p.updated_at = Utc::now();
                Ok(())
            },
        )
        .await?;

        if gateway.supports_void() {
            let request = VoidRequest {
                external_transaction_id: payment
                    .gateway
                    .external_transaction_id
                    .clone()
                    .unwrap_or_default(),
                reason: reason.to_string(),
                correlation_id: void_correlation_id(&payment.id),
            };
            let dispatched = dispatch_with_retry(&self.settings, &request.correlation_id, || {
                gateway.process_void(&request)
            })
            .await;
            match dispatched {
                Ok(result) if result.status == GatewayStatus::Failed => {
                    let error = PaymentError::GatewayDeclined {
                        reference: request.correlation_id.clone(),
                        code: result.decline_code(),
                        message: result.decline_message(),
                    };
                    self.release_void(&payment.id).await?;
                    warn!(payment_id = %payment.id, %error, "void declined, payment unchanged");
                    return Err(error);
                }
                Ok(_) => {}
                Err(error) => {
                    // Outcome unknown: the flag stays up until the recovery
                    // sweep learns what the gateway did.
                    warn!(payment_id = %payment.id, %error, "void outcome unknown, left for recovery");
                    return Err(error);
                }
            }
        }

        self.finish_void(&payment.id, reason).await
    }

    /// Tail of a void the gateway has accepted: cancels and unposts the sale,
    /// records the void, cascades the payment and refreshes the order. Every
    /// step is idempotent so the recovery sweep can re-drive it.
    pub(crate) async fn finish_void(&self, payment_id: &str, reason: &str) -> Result<VoidOutcome> {
        let max = self.max_conflicts();
        let sale = self.sale_for_payment(payment_id).await?;
        let transaction = unpost_transaction(&self.stores, max, &sale.id, |tx| {
            if tx.status != PaymentStatus::Cancelled {
                tx.transition(PaymentStatus::Cancelled)?;
            }
            Ok(())
        })
        .await?;

        let id = payment_id.to_string();
        let recorded = self
            .stores
            .transactions
            .find(&move |t: &Transaction| t.payment_id == id && t.r#type == TransactionType::Void)
            .await?;
        if recorded.is_empty() {
            self.stores
                .transactions
                .insert(Transaction::void(&transaction, reason))
                .await?;
        }

        let (payment, ()) = update_with_retry(
            self.stores.payments.as_ref(),
            payment_id,
            max,
            PaymentError::PaymentNotFound,
            |p| {
                if p.status != PaymentStatus::Cancelled {
                    p.transition(PaymentStatus::Cancelled)?;
                }
                p.void_requested = false;
                p.updated_at = Utc::now();
                Ok(())
            },
        )
        .await?;
        self.refresh_order_status(&payment.order_id).await?;
        info!(payment_id = %payment.id, "payment voided");

        Ok(VoidOutcome {
            transaction,
            payment,
        })
    }

    /// Drops the void reservation of a payment the gateway did not void.
    pub(crate) async fn release_void(&self, payment_id: &str) -> Result<Payment> {
        let (payment, ()) = update_with_retry(
            self.stores.payments.as_ref(),
            payment_id,
            self.max_conflicts(),
            PaymentError::PaymentNotFound,
            |p| {
                p.void_requested = false;
                p.updated_at = Utc::now();
                Ok(())
            },
        )
        .await?;
        Ok(payment)
    }
}
