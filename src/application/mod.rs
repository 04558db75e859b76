//! Application layer: the use cases that drive the domain through its ports.
//!
//! [`orchestrator::PaymentOrchestrator`] settles payments, refunds and voids
//! through a [`GatewayRegistry`](crate::domain::gateway::GatewayRegistry).
//! [`validator::LedgerValidator`] and
//! [`reconciliation::ReconciliationEngine`] are batch jobs over the same
//! stores, and [`recovery::RecoverySweep`] finishes work a crash interrupted.

pub mod orchestrator;
mod posting;
pub mod reconciliation;
pub mod recovery;
mod retry;
pub mod validator;
