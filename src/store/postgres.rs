use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use uuid::Uuid;

use super::{LedgerStore, StoreError, TransactionPage};
use crate::domain::aggregates::{PointsSnapshot, PointsTransaction};
use crate::domain::value_objects::{AdminId, OrderId, PageRequest, Reason, UserId};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const SNAPSHOT_COLUMNS: &str = "user_id, current_balance, total_earned, total_spent, tier, version, last_updated";
const TRANSACTION_COLUMNS: &str =
    "transaction_id, user_id, sequence, amount, kind, reason, balance_before, balance_after, created_at, admin_id, order_id";
const ORDER_INDEX: &str = "points_transactions_order_idx";

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self { Self { max_connections: 10, acquire_timeout: Duration::from_secs(10) } }
}

pub async fn connect_pool(database_url: &str, config: PoolConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    user_id: String,
    current_balance: i64,
    total_earned: i64,
    total_spent: i64,
    tier: String,
    version: i64,
    last_updated: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for PointsSnapshot {
    type Error = StoreError;
    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: UserId::new(row.user_id).map_err(corrupt)?,
            current_balance: row.current_balance,
            total_earned: row.total_earned,
            total_spent: row.total_spent,
            tier: row.tier.parse().map_err(corrupt)?,
            version: row.version,
            last_updated: row.last_updated,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    user_id: String,
    sequence: i64,
    amount: i64,
    kind: String,
    reason: String,
    balance_before: i64,
    balance_after: i64,
    created_at: DateTime<Utc>,
    admin_id: Option<String>,
    order_id: Option<String>,
}

impl TryFrom<TransactionRow> for PointsTransaction {
    type Error = StoreError;
    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            transaction_id: row.transaction_id,
            user_id: UserId::new(row.user_id).map_err(corrupt)?,
            sequence: row.sequence,
            amount: row.amount,
            kind: row.kind.parse().map_err(StoreError::Corrupt)?,
            reason: Reason::new(row.reason).map_err(corrupt)?,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            timestamp: row.created_at,
            admin_id: row.admin_id.map(AdminId::new).transpose().map_err(corrupt)?,
            order_id: row.order_id.map(OrderId::new).transpose().map_err(corrupt)?,
        })
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError { StoreError::Corrupt(e.to_string()) }

fn rows_to_transactions(rows: Vec<TransactionRow>) -> Result<Vec<PointsTransaction>, StoreError> {
    rows.into_iter().map(PointsTransaction::try_from).collect()
}

/// Postgres-backed ledger. Every mutation runs inside a database transaction,
/// so the snapshot and its ledger entry commit or roll back together.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    async fn select_snapshot(&self, user_id: &UserId) -> Result<Option<PointsSnapshot>, StoreError> {
        sqlx::query_as::<_, SnapshotRow>(&format!("SELECT {SNAPSHOT_COLUMNS} FROM points_snapshots WHERE user_id = $1"))
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(PointsSnapshot::try_from)
            .transpose()
    }

    async fn update_snapshot(conn: &mut PgConnection, snapshot: &PointsSnapshot, expected_version: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE points_snapshots \
             SET current_balance = $2, total_earned = $3, total_spent = $4, tier = $5, version = $6, last_updated = $7 \
             WHERE user_id = $1 AND version = $8",
        )
        .bind(snapshot.user_id.as_str())
        .bind(snapshot.current_balance)
        .bind(snapshot.total_earned)
        .bind(snapshot.total_spent)
        .bind(snapshot.tier.as_str())
        .bind(snapshot.version)
        .bind(snapshot.last_updated)
        .bind(expected_version)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let actual = sqlx::query_scalar::<_, i64>("SELECT version FROM points_snapshots WHERE user_id = $1")
                .bind(snapshot.user_id.as_str())
                .fetch_optional(&mut *conn)
                .await?
                .unwrap_or(0);
            return Err(StoreError::VersionConflict { user_id: snapshot.user_id.clone(), expected: expected_version, actual });
        }
        Ok(())
    }

    async fn insert_transaction(conn: &mut PgConnection, tx: &PointsTransaction) -> Result<(), StoreError> {
        if !tx.is_consistent() {
            return Err(StoreError::Corrupt(format!("transaction {} does not add up", tx.transaction_id)));
        }
        let last = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM points_transactions WHERE user_id = $1 ORDER BY sequence DESC LIMIT 1"
        ))
        .bind(tx.user_id.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .map(PointsTransaction::try_from)
        .transpose()?;
        if !tx.extends(last.as_ref()) {
            return Err(StoreError::OutOfOrder { user_id: tx.user_id.clone(), sequence: tx.sequence });
        }

        sqlx::query(&format!(
            "INSERT INTO points_transactions ({TRANSACTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(tx.transaction_id)
        .bind(tx.user_id.as_str())
        .bind(tx.sequence)
        .bind(tx.amount)
        .bind(tx.kind.as_str())
        .bind(tx.reason.as_str())
        .bind(tx.balance_before)
        .bind(tx.balance_after)
        .bind(tx.timestamp)
        .bind(tx.admin_id.as_ref().map(AdminId::as_str))
        .bind(tx.order_id.as_ref().map(OrderId::as_str))
        .execute(&mut *conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => match (&tx.order_id, db.constraint()) {
                (Some(order_id), Some(ORDER_INDEX)) => {
                    StoreError::DuplicateOrder { user_id: tx.user_id.clone(), order_id: order_id.clone() }
                }
                // Two writers raced past the chain check; the unique (user_id, sequence) key caught it.
                _ => StoreError::OutOfOrder { user_id: tx.user_id.clone(), sequence: tx.sequence },
            },
            other => StoreError::Database(other),
        })?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_snapshot(&self, user_id: &UserId) -> Result<PointsSnapshot, StoreError> {
        if let Some(snapshot) = self.select_snapshot(user_id).await? {
            return Ok(snapshot);
        }
        sqlx::query(
            "INSERT INTO points_snapshots (user_id, current_balance, total_earned, total_spent, tier, version, last_updated) \
             VALUES ($1, 0, 0, 0, 'bronze', 0, NOW()) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;

        self.select_snapshot(user_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("snapshot for {user_id} vanished after provisioning")))
    }

    async fn write_snapshot(&self, snapshot: &PointsSnapshot, expected_version: i64) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::update_snapshot(&mut conn, snapshot, expected_version).await
    }

    async fn append_transaction(&self, transaction: &PointsTransaction) -> Result<Uuid, StoreError> {
        let mut db_tx = self.pool.begin().await?;
        Self::insert_transaction(&mut db_tx, transaction).await?;
        db_tx.commit().await?;
        Ok(transaction.transaction_id)
    }

    async fn commit(&self, snapshot: &PointsSnapshot, transaction: &PointsTransaction, expected_version: i64) -> Result<(), StoreError> {
        if snapshot.version != transaction.sequence || snapshot.current_balance != transaction.balance_after {
            return Err(StoreError::Corrupt(format!("snapshot v{} does not match transaction {}", snapshot.version, transaction.sequence)));
        }
        // Dropping `db_tx` before `commit` rolls both writes back.
        let mut db_tx = self.pool.begin().await?;
        Self::update_snapshot(&mut db_tx, snapshot, expected_version).await?;
        Self::insert_transaction(&mut db_tx, transaction).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn list_transactions(&self, user_id: &UserId, page: PageRequest) -> Result<TransactionPage, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM points_transactions \
             WHERE user_id = $1 AND sequence < $2 ORDER BY sequence DESC LIMIT $3"
        ))
        .bind(user_id.as_str())
        .bind(page.before.unwrap_or(i64::MAX))
        .bind(i64::from(page.limit) + 1)
        .fetch_all(&self.pool)
        .await?;
        Ok(TransactionPage::from_overfetch(rows_to_transactions(rows)?, page.limit))
    }

    async fn find_order_transaction(&self, user_id: &UserId, order_id: &OrderId) -> Result<Option<PointsTransaction>, StoreError> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM points_transactions WHERE user_id = $1 AND order_id = $2"
        ))
        .bind(user_id.as_str())
        .bind(order_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(PointsTransaction::try_from)
        .transpose()
    }

    async fn list_recent_transactions(&self, limit: u32) -> Result<Vec<PointsTransaction>, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM points_transactions ORDER BY created_at DESC, transaction_id DESC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows_to_transactions(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
