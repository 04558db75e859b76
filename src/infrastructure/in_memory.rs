use crate::domain::ports::{Collection, Document, Filter, Stores};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory collection.
///
/// Uses `Arc<RwLock<BTreeMap<String, T>>>` so clones share state and pages
/// come out in id order. The version check and the write happen under one
/// write lock, which makes `update` a true compare-and-set.
pub struct InMemoryCollection<T> {
    docs: Arc<RwLock<BTreeMap<String, T>>>,
}

impl<T> Default for InMemoryCollection<T> {
    fn default() -> Self {
        Self {
            docs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<T> Clone for InMemoryCollection<T> {
    fn clone(&self) -> Self {
        Self {
            docs: Arc::clone(&self.docs),
        }
    }
}

impl<T> InMemoryCollection<T> {
    /// Creates a new, empty in-memory collection.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T: Document> Collection<T> for InMemoryCollection<T> {
    async fn store(&self, doc: T) -> Result<()> {
        let mut docs = self.docs.write().await;
        docs.insert(doc.id().to_string(), doc);
        Ok(())
    }

    async fn insert(&self, doc: T) -> Result<T> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(doc.id()) {
            return Err(PaymentError::ConcurrencyConflict {
                entity: T::COLLECTION,
                id: doc.id().to_string(),
            });
        }
        docs.insert(doc.id().to_string(), doc.clone());
        Ok(doc)
    }

    async fn get(&self, id: &str) -> Result<Option<T>> {
        let docs = self.docs.read().await;
        Ok(docs.get(id).cloned())
    }

    async fn update(&self, mut doc: T) -> Result<T> {
        let mut docs = self.docs.write().await;
        let stored_version = docs.get(doc.id()).map(Document::version);
        if stored_version != Some(doc.version()) {
            return Err(PaymentError::ConcurrencyConflict {
                entity: T::COLLECTION,
                id: doc.id().to_string(),
            });
        }
        doc.set_version(doc.version() + 1);
        docs.insert(doc.id().to_string(), doc.clone());
        Ok(doc)
    }

    async fn page(&self, after: Option<&str>, limit: usize) -> Result<Vec<T>> {
        let docs = self.docs.read().await;
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(docs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn find(&self, filter: Filter<'_, T>) -> Result<Vec<T>> {
        let docs = self.docs.read().await;
        Ok(docs.values().filter(|d| filter(d)).cloned().collect())
    }
}

impl Stores {
    /// Every collection backed by its own [`InMemoryCollection`].
    pub fn in_memory() -> Self {
        Self {
            orders: Arc::new(InMemoryCollection::new()),
            payments: Arc::new(InMemoryCollection::new()),
            transactions: Arc::new(InMemoryCollection::new()),
            accounts: Arc::new(InMemoryCollection::new()),
            customers: Arc::new(InMemoryCollection::new()),
            customer_transactions: Arc::new(InMemoryCollection::new()),
            products: Arc::new(InMemoryCollection::new()),
            inventory: Arc::new(InMemoryCollection::new()),
            audit_log: Arc::new(InMemoryCollection::new()),
        }
    }
}
