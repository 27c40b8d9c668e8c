//! Ledger Store: durable snapshots plus the append-only transaction log.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::{connect_pool, run_migrations, PgLedgerStore, PoolConfig};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{PointsSnapshot, PointsTransaction};
use crate::domain::value_objects::{OrderId, PageRequest, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger store unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot for {user_id} is at version {actual}, expected {expected}")]
    VersionConflict { user_id: UserId, expected: i64, actual: i64 },
    #[error("transaction {sequence} for {user_id} does not extend the ledger")]
    OutOfOrder { user_id: UserId, sequence: i64 },
    #[error("order {order_id} was already credited to {user_id}")]
    DuplicateOrder { user_id: UserId, order_id: OrderId },
    #[error("corrupt ledger record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// One page of a user's ledger, newest first. Pass `next_cursor` back as
/// `PageRequest::before` to continue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub transactions: Vec<PointsTransaction>,
    pub next_cursor: Option<i64>,
}

impl TransactionPage {
    /// Builds a page from up to `limit + 1` rows fetched newest first.
    pub(crate) fn from_overfetch(mut rows: Vec<PointsTransaction>, limit: u32) -> Self {
        let limit = limit as usize;
        let more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if more { rows.last().map(|t| t.sequence) } else { None };
        Self { transactions: rows, next_cursor }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Returns the user's snapshot, provisioning a zero snapshot on first read.
    async fn get_snapshot(&self, user_id: &UserId) -> Result<PointsSnapshot, StoreError>;

    /// Replaces the snapshot if the stored version still equals `expected_version`.
    async fn write_snapshot(&self, snapshot: &PointsSnapshot, expected_version: i64) -> Result<(), StoreError>;

    /// Appends an entry that must extend the user's current chain.
    async fn append_transaction(&self, transaction: &PointsTransaction) -> Result<Uuid, StoreError>;

    /// Writes the snapshot and its ledger entry as one atomic unit.
    async fn commit(&self, snapshot: &PointsSnapshot, transaction: &PointsTransaction, expected_version: i64) -> Result<(), StoreError>;

    async fn list_transactions(&self, user_id: &UserId, page: PageRequest) -> Result<TransactionPage, StoreError>;

    /// The entry that credited `order_id` to this user, if any.
    async fn find_order_transaction(&self, user_id: &UserId, order_id: &OrderId) -> Result<Option<PointsTransaction>, StoreError>;

    /// Newest entries across every user, for the admin dashboard.
    async fn list_recent_transactions(&self, limit: u32) -> Result<Vec<PointsTransaction>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
