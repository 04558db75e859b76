use crate::impl_document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record of an automatic correction, kept for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub entity: String,
    pub entity_id: String,
    pub action: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl_document!(AuditEntry, "audit_log", id);

impl AuditEntry {
    pub fn new(
        entity: &str,
        entity_id: &str,
        action: &str,
        before: serde_json::Value,
        after: serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            before,
            after,
            reason: reason.into(),
            created_at: Utc::now(),
            version: 0,
        }
    }
}
