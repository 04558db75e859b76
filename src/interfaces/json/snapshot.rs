use crate::domain::account::LedgerAccount;
use crate::domain::audit::AuditEntry;
use crate::domain::customer::{Customer, CustomerTransaction};
use crate::domain::inventory::{InventoryRecord, Product};
use crate::domain::order::Order;
use crate::domain::payment::Payment;
use crate::domain::ports::{Collection, Document, PageCursor, Stores};
use crate::domain::transaction::Transaction;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

const EXPORT_PAGE_SIZE: usize = 500;

/// A JSON dump of every collection, as loaded by `--snapshot`.
///
/// Missing collections default to empty. Monetary values may be given as
/// strings (`"12.50"`) or numbers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub orders: Vec<Order>,
    pub payments: Vec<Payment>,
    pub transactions: Vec<Transaction>,
    pub accounts: Vec<LedgerAccount>,
    pub customers: Vec<Customer>,
    pub customer_transactions: Vec<CustomerTransaction>,
    pub products: Vec<Product>,
    pub inventory: Vec<InventoryRecord>,
    pub audit_log: Vec<AuditEntry>,
}

impl Snapshot {
    pub fn from_reader<R: Read>(source: R) -> Result<Self> {
        Ok(serde_json::from_reader(source)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn write_to<W: Write>(&self, destination: W) -> Result<()> {
        serde_json::to_writer_pretty(destination, self)?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Upserts every record into `stores`, keeping the ids (and therefore
    /// any duplicates of business keys) as they are in the dump.
    pub async fn load_into(self, stores: &Stores) -> Result<()> {
        let total = self.len();
        put_all(stores.orders.as_ref(), self.orders).await?;
        put_all(stores.payments.as_ref(), self.payments).await?;
        put_all(stores.transactions.as_ref(), self.transactions).await?;
        put_all(stores.accounts.as_ref(), self.accounts).await?;
        put_all(stores.customers.as_ref(), self.customers).await?;
        put_all(stores.customer_transactions.as_ref(), self.customer_transactions).await?;
        put_all(stores.products.as_ref(), self.products).await?;
        put_all(stores.inventory.as_ref(), self.inventory).await?;
        put_all(stores.audit_log.as_ref(), self.audit_log).await?;
        info!(records = total, "snapshot loaded");
        Ok(())
    }

    /// Reads every collection back out of `stores`.
    pub async fn capture(stores: &Stores) -> Result<Self> {
        Ok(Self {
            orders: read_all(stores.orders.as_ref()).await?,
            payments: read_all(stores.payments.as_ref()).await?,
            transactions: read_all(stores.transactions.as_ref()).await?,
            accounts: read_all(stores.accounts.as_ref()).await?,
            customers: read_all(stores.customers.as_ref()).await?,
            customer_transactions: read_all(stores.customer_transactions.as_ref()).await?,
            products: read_all(stores.products.as_ref()).await?,
            inventory: read_all(stores.inventory.as_ref()).await?,
            audit_log: read_all(stores.audit_log.as_ref()).await?,
        })
    }

    pub fn len(&self) -> usize {
        self.orders.len()
            + self.payments.len()
            + self.transactions.len()
            + self.accounts.len()
            + self.customers.len()
            + self.customer_transactions.len()
            + self.products.len()
            + self.inventory.len()
            + self.audit_log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn put_all<T: Document>(collection: &dyn Collection<T>, docs: Vec<T>) -> Result<()> {
    for doc in docs {
        collection.store(doc).await?;
    }
    Ok(())
}

async fn read_all<T: Document>(collection: &dyn Collection<T>) -> Result<Vec<T>> {
    let mut all = Vec::new();
    let mut cursor = PageCursor::new(collection, EXPORT_PAGE_SIZE);
    while let Some(page) = cursor.next_page().await? {
        all.extend(page);
    }
    Ok(all)
}
