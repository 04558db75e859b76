use crate::domain::account::LedgerAccount;
use crate::domain::audit::AuditEntry;
use crate::domain::customer::{Customer, CustomerTransaction};
use crate::domain::inventory::{InventoryRecord, Product};
use crate::domain::order::Order;
use crate::domain::payment::Payment;
use crate::domain::ports::{Collection, Document, Filter, Stores};
use crate::domain::transaction::Transaction;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One column family per collection.
pub const COLUMN_FAMILIES: &[&str] = &[
    Order::COLLECTION,
    Payment::COLLECTION,
    Transaction::COLLECTION,
    LedgerAccount::COLLECTION,
    Customer::COLLECTION,
    CustomerTransaction::COLLECTION,
    Product::COLLECTION,
    InventoryRecord::COLLECTION,
    AuditEntry::COLLECTION,
];

/// A persistent store implementation using RocksDB.
///
/// Every document type lives in its own column family, keyed by its id and
/// stored as JSON. Writes go through a store-wide lock so the
/// read-compare-write of [`Collection::update`] is atomic; reads never take
/// it.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column family.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Exposes every collection of this database as a [`Stores`] bundle.
    pub fn into_stores(self) -> Stores {
        Stores {
            orders: Arc::new(self.clone()),
            payments: Arc::new(self.clone()),
            transactions: Arc::new(self.clone()),
            accounts: Arc::new(self.clone()),
            customers: Arc::new(self.clone()),
            customer_transactions: Arc::new(self.clone()),
            products: Arc::new(self.clone()),
            inventory: Arc::new(self.clone()),
            audit_log: Arc::new(self),
        }
    }

    fn cf<T: Document>(&self) -> Result<&ColumnFamily> {
        self.db.cf_handle(T::COLLECTION).ok_or_else(|| {
            PaymentError::StorageError(format!("column family {} not found", T::COLLECTION))
        })
    }

    fn read<T: Document>(&self, id: &str) -> Result<Option<T>> {
        let cf = self.cf::<T>()?;
        match self.db.get_pinned_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Document>(&self, doc: &T) -> Result<()> {
        let cf = self.cf::<T>()?;
        let value = serde_json::to_vec(doc)?;
        self.db.put_cf(&cf, doc.id().as_bytes(), value)?;
        Ok(())
    }

    fn scan<T: Document>(
        &self,
        after: Option<&str>,
        mut visit: impl FnMut(T) -> bool,
    ) -> Result<()> {
        let cf = self.cf::<T>()?;
        let mode = match after {
            Some(id) => IteratorMode::From(id.as_bytes(), Direction::Forward),
            None => IteratorMode::Start,
        };
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item?;
            if after.is_some_and(|id| key.as_ref() == id.as_bytes()) {
                continue;
            }
            if !visit(serde_json::from_slice(&value)?) {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Document> Collection<T> for RocksDBStore {
    async fn store(&self, doc: T) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(&doc)
    }

    async fn insert(&self, doc: T) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        if self.read::<T>(doc.id())?.is_some() {
            return Err(PaymentError::ConcurrencyConflict {
                entity: T::COLLECTION,
                id: doc.id().to_string(),
            });
        }
        self.write(&doc)?;
        Ok(doc)
    }

    async fn get(&self, id: &str) -> Result<Option<T>> {
        self.read(id)
    }

    async fn update(&self, mut doc: T) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let stored_version = self.read::<T>(doc.id())?.map(|d| d.version());
        if stored_version != Some(doc.version()) {
            return Err(PaymentError::ConcurrencyConflict {
                entity: T::COLLECTION,
                id: doc.id().to_string(),
            });
        }
        doc.set_version(doc.version() + 1);
        self.write(&doc)?;
        Ok(doc)
    }

    async fn page(&self, after: Option<&str>, limit: usize) -> Result<Vec<T>> {
        let mut docs = Vec::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(docs);
        }
        self.scan(after, |doc: T| {
            docs.push(doc);
            docs.len() < limit
        })?;
        Ok(docs)
    }

    async fn find(&self, filter: Filter<'_, T>) -> Result<Vec<T>> {
        let mut docs = Vec::new();
        self.scan(None, |doc: T| {
            if filter(&doc) {
                docs.push(doc);
            }
            true
        })?;
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountType;
    use crate::domain::money::Balance;
    use crate::domain::ports::PageCursor;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        for name in COLUMN_FAMILIES {
            assert!(store.db.cf_handle(name).is_some(), "missing {name}");
        }
    }

    #[tokio::test]
    async fn test_rocksdb_account_collection() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let mut account = LedgerAccount::new("1000", "Cash", AccountType::Asset);
        account.current_balance = Balance::new(dec!(100.0));

        Collection::<LedgerAccount>::insert(&store, account.clone())
            .await
            .unwrap();
        let retrieved = Collection::<LedgerAccount>::get(&store, "1000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retrieved, account);

        let missing = Collection::<LedgerAccount>::get(&store, "2000").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_rocksdb_update_rejects_stale_version() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let account = Collection::<LedgerAccount>::insert(
            &store,
            LedgerAccount::new("1000", "Cash", AccountType::Asset),
        )
        .await
        .unwrap();

        let updated = store.update(account.clone()).await.unwrap();
        assert_eq!(updated.version, 1);
        assert!(matches!(
            store.update(account).await,
            Err(PaymentError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_rocksdb_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            for code in ["1000", "1100", "1200"] {
                Collection::<LedgerAccount>::store(
                    &store,
                    LedgerAccount::new(code, "acct", AccountType::Asset),
                )
                .await
                .unwrap();
            }
        }

        let stores = RocksDBStore::open(dir.path()).unwrap().into_stores();
        let mut cursor = PageCursor::new(stores.accounts.as_ref(), 2);
        let mut codes = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            codes.extend(page.into_iter().map(|a| a.account_code));
        }
        assert_eq!(codes, vec!["1000", "1100", "1200"]);
    }
}
