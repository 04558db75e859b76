use super::account::LedgerAccount;
use super::audit::AuditEntry;
use super::customer::{Customer, CustomerTransaction};
use super::inventory::{InventoryRecord, Product};
use super::order::Order;
use super::payment::Payment;
use super::transaction::Transaction;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// A record that can be kept in a [`Collection`].
///
/// `version` is the optimistic-concurrency token: every successful
/// [`Collection::update`] bumps it, and an update carrying a stale version is
/// rejected.
pub trait Document: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Implements [`Document`] for an entity with `id: String` and `version: u64`.
#[macro_export]
macro_rules! impl_document {
    ($ty:ty, $collection:literal, $id:ident) => {
        impl $crate::domain::ports::Document for $ty {
            const COLLECTION: &'static str = $collection;

            fn id(&self) -> &str {
                &self.$id
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

pub type Filter<'a, T> = &'a (dyn Fn(&T) -> bool + Send + Sync);

/// Durable keyed-record store for one entity type.
///
/// Implementations guarantee single-document atomicity only; callers that
/// touch several documents order their writes so that a crash leaves a state
/// the recovery sweep can finish.
#[async_trait]
pub trait Collection<T: Document>: Send + Sync {
    /// Unconditional upsert. Used for imports and seeding, never for
    /// read-modify-write cycles.
    async fn store(&self, doc: T) -> Result<()>;

    /// Inserts a new document; fails with `ConcurrencyConflict` if the id is
    /// already taken.
    async fn insert(&self, doc: T) -> Result<T>;

    async fn get(&self, id: &str) -> Result<Option<T>>;

    /// Compare-and-set on `version`: succeeds only if the stored version equals
    /// `doc.version()`, and returns the document with its version bumped.
    async fn update(&self, doc: T) -> Result<T>;

    /// Up to `limit` documents with ids strictly greater than `after`, in id
    /// order.
    async fn page(&self, after: Option<&str>, limit: usize) -> Result<Vec<T>>;

    async fn find(&self, filter: Filter<'_, T>) -> Result<Vec<T>>;
}

pub type CollectionBox<T> = Arc<dyn Collection<T>>;

/// Walks a collection in bounded pages.
pub struct PageCursor<'a, T: Document> {
    collection: &'a dyn Collection<T>,
    page_size: usize,
    after: Option<String>,
    exhausted: bool,
}

impl<'a, T: Document> PageCursor<'a, T> {
    pub fn new(collection: &'a dyn Collection<T>, page_size: usize) -> Self {
        Self {
            collection,
            page_size: page_size.max(1),
            after: None,
            exhausted: false,
        }
    }

    /// Returns the next non-empty page, or `None` once the collection is
    /// exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .collection
            .page(self.after.as_deref(), self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.after = Some(last.id().to_string());
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}

/// All collections this crate reads or writes, shared by the orchestrator,
/// the validator and the reconciliation engine.
#[derive(Clone)]
pub struct Stores {
    pub orders: CollectionBox<Order>,
    pub payments: CollectionBox<Payment>,
    pub transactions: CollectionBox<Transaction>,
    pub accounts: CollectionBox<LedgerAccount>,
    pub customers: CollectionBox<Customer>,
    pub customer_transactions: CollectionBox<CustomerTransaction>,
    pub products: CollectionBox<Product>,
    pub inventory: CollectionBox<InventoryRecord>,
    pub audit_log: CollectionBox<AuditEntry>,
}
