use crate::impl_document;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub sku: Option<String>,
    /// Cached copy of the inventory record's `current_stock`.
    pub current_stock: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub version: u64,
}

fn default_active() -> bool {
    true
}

impl_document!(Product, "products", id);

/// Authoritative stock levels; keyed by the product id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub product_id: String,
    pub current_stock: i64,
    #[serde(default)]
    pub reserved_stock: i64,
    #[serde(default)]
    pub available_stock: i64,
    #[serde(default)]
    pub version: u64,
}

impl_document!(InventoryRecord, "inventory", product_id);

impl InventoryRecord {
    pub fn expected_available(&self) -> i64 {
        (self.current_stock - self.reserved_stock).max(0)
    }

    pub fn recompute_available(&mut self) {
        self.available_stock = self.expected_available();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_available_never_negative() {
        let mut record = InventoryRecord {
            product_id: "prd-1".to_string(),
            current_stock: 3,
            reserved_stock: 5,
            available_stock: -2,
            version: 0,
        };
        assert_eq!(record.expected_available(), 0);
        record.recompute_available();
        assert_eq!(record.available_stock, 0);

        record.current_stock = 10;
        record.recompute_available();
        assert_eq!(record.available_stock, 5);
    }
}
