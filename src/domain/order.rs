use crate::impl_document;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPaymentStatus {
    #[default]
    Unpaid,
    PartiallyPaid,
    Paid,
}

/// A sale, owned by the sales subsystem. Only `payment_status` is written
/// here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub customer_id: Option<String>,
    pub total: Decimal,
    #[serde(default)]
    pub payment_status: OrderPaymentStatus,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl_document!(Order, "orders", id);

impl Order {
    pub fn payment_status_for(&self, net_paid: Decimal) -> OrderPaymentStatus {
        if net_paid <= Decimal::ZERO {
            OrderPaymentStatus::Unpaid
        } else if net_paid < self.total {
            OrderPaymentStatus::PartiallyPaid
        } else {
            OrderPaymentStatus::Paid
        }
    }
}
