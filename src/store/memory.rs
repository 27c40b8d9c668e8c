use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{LedgerStore, StoreError, TransactionPage};
use crate::domain::aggregates::{PointsSnapshot, PointsTransaction};
use crate::domain::value_objects::{OrderId, PageRequest, UserId};

/// Process-local ledger. Used for tests and for running without Postgres.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    inner: RwLock<Ledgers>,
    unavailable: AtomicBool,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct Ledgers {
    snapshots: HashMap<UserId, PointsSnapshot>,
    entries: HashMap<UserId, Vec<PointsTransaction>>,
}

impl Ledgers {
    fn version(&self, user_id: &UserId) -> i64 {
        self.snapshots.get(user_id).map_or(0, |s| s.version)
    }

    fn check_version(&self, user_id: &UserId, expected: i64) -> Result<(), StoreError> {
        let actual = self.version(user_id);
        if actual != expected {
            return Err(StoreError::VersionConflict { user_id: user_id.clone(), expected, actual });
        }
        Ok(())
    }

    fn check_extends(&self, tx: &PointsTransaction) -> Result<(), StoreError> {
        if !tx.is_consistent() {
            return Err(StoreError::Corrupt(format!("transaction {} does not add up", tx.transaction_id)));
        }
        let last = self.entries.get(&tx.user_id).and_then(|v| v.last());
        if !tx.extends(last) {
            return Err(StoreError::OutOfOrder { user_id: tx.user_id.clone(), sequence: tx.sequence });
        }
        if let Some(order_id) = &tx.order_id {
            if self.order_entry(&tx.user_id, order_id).is_some() {
                return Err(StoreError::DuplicateOrder { user_id: tx.user_id.clone(), order_id: order_id.clone() });
            }
        }
        Ok(())
    }

    fn order_entry(&self, user_id: &UserId, order_id: &OrderId) -> Option<&PointsTransaction> {
        self.entries.get(user_id)?.iter().find(|t| t.order_id.as_ref() == Some(order_id))
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self { Self::default() }

    /// Delays every call, to exercise caller timeouts.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency: Some(latency), ..Self::default() }
    }

    /// Simulates the backend going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), StoreError> {
        if let Some(latency) = self.latency { tokio::time::sleep(latency).await; }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_snapshot(&self, user_id: &UserId) -> Result<PointsSnapshot, StoreError> {
        self.gate().await?;
        if let Some(s) = self.inner.read().await.snapshots.get(user_id) {
            return Ok(s.clone());
        }
        let mut inner = self.inner.write().await;
        let snapshot = inner.snapshots.entry(user_id.clone()).or_insert_with(|| PointsSnapshot::zero(user_id.clone(), Utc::now()));
        Ok(snapshot.clone())
    }

    async fn write_snapshot(&self, snapshot: &PointsSnapshot, expected_version: i64) -> Result<(), StoreError> {
        self.gate().await?;
        let mut inner = self.inner.write().await;
        inner.check_version(&snapshot.user_id, expected_version)?;
        inner.snapshots.insert(snapshot.user_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn append_transaction(&self, transaction: &PointsTransaction) -> Result<Uuid, StoreError> {
        self.gate().await?;
        let mut inner = self.inner.write().await;
        inner.check_extends(transaction)?;
        inner.entries.entry(transaction.user_id.clone()).or_default().push(transaction.clone());
        Ok(transaction.transaction_id)
    }

    async fn commit(&self, snapshot: &PointsSnapshot, transaction: &PointsTransaction, expected_version: i64) -> Result<(), StoreError> {
        self.gate().await?;
        if snapshot.version != transaction.sequence || snapshot.current_balance != transaction.balance_after {
            return Err(StoreError::Corrupt(format!("snapshot v{} does not match transaction {}", snapshot.version, transaction.sequence)));
        }
        let mut inner = self.inner.write().await;
        inner.check_version(&snapshot.user_id, expected_version)?;
        inner.check_extends(transaction)?;
        inner.snapshots.insert(snapshot.user_id.clone(), snapshot.clone());
        inner.entries.entry(transaction.user_id.clone()).or_default().push(transaction.clone());
        Ok(())
    }

    async fn list_transactions(&self, user_id: &UserId, page: PageRequest) -> Result<TransactionPage, StoreError> {
        self.gate().await?;
        let inner = self.inner.read().await;
        let before = page.before.unwrap_or(i64::MAX);
        let rows: Vec<PointsTransaction> = inner.entries.get(user_id).map(|entries| {
            entries.iter().rev().filter(|t| t.sequence < before).take(page.limit as usize + 1).cloned().collect()
        }).unwrap_or_default();
        Ok(TransactionPage::from_overfetch(rows, page.limit))
    }

    async fn find_order_transaction(&self, user_id: &UserId, order_id: &OrderId) -> Result<Option<PointsTransaction>, StoreError> {
        self.gate().await?;
        Ok(self.inner.read().await.order_entry(user_id, order_id).cloned())
    }

    async fn list_recent_transactions(&self, limit: u32) -> Result<Vec<PointsTransaction>, StoreError> {
        self.gate().await?;
        let inner = self.inner.read().await;
        let mut all: Vec<_> = inner.entries.values().flatten().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.transaction_id.cmp(&a.transaction_id)));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn ping(&self) -> Result<(), StoreError> { self.gate().await }
}
