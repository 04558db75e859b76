//! Finishes work interrupted between a gateway call and the record update.
//!
//! Payments left `pending`/`processing` and refunds left `pending` for longer
//! than the grace period are looked up in the gateway's own transaction log
//! by correlation id:
//!
//! - found: the gateway's answer is applied exactly as the live path would;
//! - not found: the request never reached the gateway, the record is failed
//!   with `not_dispatched` (a refund reservation is released);
//! - lookup unsupported or transport failure: left untouched and reported.
//!
//! Payments still carrying a void reservation are finished the same way: a
//! void the gateway confirms (or a sale already cancelled locally) gets the
//! rest of the void applied; a void the gateway declined or never saw only
//! releases the reservation.
//!
//! Settled transactions whose ledger posting never happened are posted last.

use super::orchestrator::{PaymentOrchestrator, void_correlation_id};
use super::posting::post_transaction;
use crate::config::Settings;
use crate::domain::gateway::{GatewayErrorCode, GatewayResult, GatewayStatus, Lookup};
use crate::domain::payment::{Payment, PaymentStatus, RefundStatus};
use crate::domain::ports::{PageCursor, Stores};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveredKind {
    Payment,
    Refund,
    Void,
}

#[derive(Debug, Clone, Serialize)]
pub struct Unresolved {
    pub kind: RecoveredKind,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub payments_examined: usize,
    pub payments_resolved: usize,
    pub refunds_examined: usize,
    pub refunds_resolved: usize,
    pub voids_examined: usize,
    pub voids_resolved: usize,
    /// Resolved records the gateway had never seen.
    pub not_dispatched: usize,
    pub postings_repaired: usize,
    pub unresolved: Vec<Unresolved>,
}

#[derive(Clone, Copy)]
enum LookupKind {
    Charge,
    Refund,
    Void,
}

const VOID_RECOVERY_REASON: &str = "void confirmed by recovery sweep";

enum Resolution {
    Applied(GatewayResult),
    NeverDispatched(GatewayResult),
    Unresolved(String),
}

pub struct RecoverySweep {
    orchestrator: PaymentOrchestrator,
    stores: Stores,
    settings: Arc<Settings>,
}

impl RecoverySweep {
    pub fn new(orchestrator: PaymentOrchestrator, stores: Stores, settings: Arc<Settings>) -> Self {
        Self {
            orchestrator,
            stores,
            settings,
        }
    }

    pub async fn run(&self) -> Result<RecoveryReport> {
        self.run_at(Utc::now()).await
    }

    /// Runs the sweep as if the current time were `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let cutoff = now - Duration::seconds(self.settings.recovery_grace_secs);
        let mut report = RecoveryReport::default();

        let mut cursor = PageCursor::new(self.stores.payments.as_ref(), self.settings.audit_page_size);
        while let Some(page) = cursor.next_page().await? {
            for payment in page {
                if payment.status.is_in_flight() && payment.created_at <= cutoff {
                    self.recover_payment(&payment, &mut report).await?;
                }
                for refund in payment
                    .refunds
                    .iter()
                    .filter(|r| r.status == RefundStatus::Pending && r.created_at <= cutoff)
                {
                    self.recover_refund(&payment, &refund.id, &mut report).await?;
                }
                if payment.void_requested && payment.updated_at <= cutoff {
                    self.recover_void(&payment, &mut report).await?;
                }
            }
        }

        report.postings_repaired = self.repair_postings().await?;
        info!(
            payments_resolved = report.payments_resolved,
            refunds_resolved = report.refunds_resolved,
            voids_resolved = report.voids_resolved,
            postings_repaired = report.postings_repaired,
            unresolved = report.unresolved.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }

    async fn resolve(&self, payment: &Payment, correlation_id: &str, kind: LookupKind) -> Resolution {
        let gateway = match self.orchestrator.gateways().get(&payment.gateway.name) {
            Ok(gateway) => gateway,
            Err(e) => return Resolution::Unresolved(e.to_string()),
        };
        let lookup = match kind {
            LookupKind::Charge => gateway.lookup(correlation_id).await,
            LookupKind::Refund => gateway.lookup_refund(correlation_id).await,
            LookupKind::Void => gateway.lookup_void(correlation_id).await,
        };
        match lookup {
            Ok(Lookup::Found(result)) => Resolution::Applied(result),
            Ok(Lookup::NotFound) => Resolution::NeverDispatched(GatewayResult::declined(
                GatewayErrorCode::NotDispatched,
                "request never reached the gateway",
                serde_json::Value::Null,
            )),
            Ok(Lookup::Unsupported) => Resolution::Unresolved(format!(
                "gateway {} cannot look up transactions",
                payment.gateway.name
            )),
            Err(e) => Resolution::Unresolved(e.to_string()),
        }
    }

    async fn recover_payment(&self, payment: &Payment, report: &mut RecoveryReport) -> Result<()> {
        report.payments_examined += 1;
        match self.resolve(payment, &payment.id, LookupKind::Charge).await {
            Resolution::Applied(result) => {
                let (payment, _) = self.orchestrator.settle_charge(&payment.id, &result).await?;
                if payment.status.is_in_flight() {
                    report.unresolved.push(Unresolved {
                        kind: RecoveredKind::Payment,
                        id: payment.id.clone(),
                        reason: "gateway still reports the payment as pending".to_string(),
                    });
                } else {
                    info!(payment_id = %payment.id, status = %payment.status, "payment recovered");
                    report.payments_resolved += 1;
                }
            }
            Resolution::NeverDispatched(result) => {
                self.orchestrator.settle_charge(&payment.id, &result).await?;
                info!(payment_id = %payment.id, "payment never dispatched, marked failed");
                report.payments_resolved += 1;
                report.not_dispatched += 1;
            }
            Resolution::Unresolved(reason) => {
                warn!(payment_id = %payment.id, %reason, "payment left in flight");
                report.unresolved.push(Unresolved {
                    kind: RecoveredKind::Payment,
                    id: payment.id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn recover_refund(
        &self,
        payment: &Payment,
        refund_id: &str,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        report.refunds_examined += 1;
        match self.resolve(payment, refund_id, LookupKind::Refund).await {
            Resolution::Applied(result) => {
                let outcome = self
                    .orchestrator
                    .settle_refund(&payment.id, refund_id, &result)
                    .await?;
                if outcome.refund.status == RefundStatus::Pending {
                    report.unresolved.push(Unresolved {
                        kind: RecoveredKind::Refund,
                        id: refund_id.to_string(),
                        reason: "gateway still reports the refund as pending".to_string(),
                    });
                } else {
                    info!(payment_id = %payment.id, refund_id, status = ?outcome.refund.status, "refund recovered");
                    report.refunds_resolved += 1;
                }
            }
            Resolution::NeverDispatched(result) => {
                self.orchestrator
                    .settle_refund(&payment.id, refund_id, &result)
                    .await?;
                info!(payment_id = %payment.id, refund_id, "refund never dispatched, reservation released");
                report.refunds_resolved += 1;
                report.not_dispatched += 1;
            }
            Resolution::Unresolved(reason) => {
                warn!(payment_id = %payment.id, refund_id, %reason, "refund left pending");
                report.unresolved.push(Unresolved {
                    kind: RecoveredKind::Refund,
                    id: refund_id.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn recover_void(&self, payment: &Payment, report: &mut RecoveryReport) -> Result<()> {
        report.voids_examined += 1;
        let sale = self.orchestrator.sale_for_payment(&payment.id).await?;
        let local_only = self
            .orchestrator
            .gateways()
            .get(&payment.gateway.name)
            .is_ok_and(|g| !g.supports_void());

        let confirmed = if sale.status == PaymentStatus::Cancelled || local_only {
            Some(true)
        } else {
            match self
                .resolve(payment, &void_correlation_id(&payment.id), LookupKind::Void)
                .await
            {
                Resolution::Applied(result) => match result.status {
                    GatewayStatus::Completed => Some(true),
                    GatewayStatus::Failed => Some(false),
                    GatewayStatus::Pending => {
                        report.unresolved.push(Unresolved {
                            kind: RecoveredKind::Void,
                            id: payment.id.clone(),
                            reason: "gateway still reports the void as pending".to_string(),
                        });
                        None
                    }
                },
                Resolution::NeverDispatched(_) => {
                    report.not_dispatched += 1;
                    Some(false)
                }
                Resolution::Unresolved(reason) => {
                    warn!(payment_id = %payment.id, %reason, "void left reserved");
                    report.unresolved.push(Unresolved {
                        kind: RecoveredKind::Void,
                        id: payment.id.clone(),
                        reason,
                    });
                    None
                }
            }
        };

        match confirmed {
            Some(true) => {
                self.orchestrator
                    .finish_void(&payment.id, VOID_RECOVERY_REASON)
                    .await?;
                info!(payment_id = %payment.id, "interrupted void finished");
            }
            Some(false) => {
                self.orchestrator.release_void(&payment.id).await?;
                info!(payment_id = %payment.id, "gateway did not void, reservation released");
            }
            None => return Ok(()),
        }
        report.voids_resolved += 1;
        Ok(())
    }

    /// Posts settled transactions whose `ledger_posted` flag is still down.
    async fn repair_postings(&self) -> Result<usize> {
        let mut unposted = Vec::new();
        let mut cursor =
            PageCursor::new(self.stores.transactions.as_ref(), self.settings.audit_page_size);
        while let Some(page) = cursor.next_page().await? {
            unposted.extend(
                page.into_iter()
                    .filter(|t| t.is_posted_status() && !t.ledger_posted && t.has_posting())
                    .map(|t| t.id),
            );
        }
        let mut repaired = 0;
        for id in unposted {
            let tx = post_transaction(
                &self.stores,
                self.settings.max_conflict_retries,
                &id,
                |_| Ok(()),
            )
            .await?;
            if tx.ledger_posted {
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}
