//! Points Service: the only path that mutates a user's balance.

mod locks;
mod reconcile;

pub use reconcile::{Discrepancy, ReconciliationReport};

use chrono::Utc;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::audit::{AuditError, AuditOutbox};
use crate::domain::aggregates::{PointsAccount, PointsChange, PointsSnapshot, PointsTransaction};
use crate::domain::events::PointsEvent;
use crate::domain::rules::{TierConfig, TierProgress};
use crate::domain::value_objects::{AdminId, OrderId, PageRequest, Reason, UserId};
use crate::store::{LedgerStore, StoreError, TransactionPage};
use crate::{LoyaltyError, Result};
use locks::UserLocks;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// Extra attempts after a version conflict from another writer.
    pub max_conflict_retries: u32,
    /// Buffered entries per transaction-stream subscriber.
    pub stream_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self { store_timeout: Duration::from_secs(5), max_conflict_retries: 3, stream_capacity: 256 }
    }
}

pub struct PointsService {
    store: Arc<dyn LedgerStore>,
    tiers: RwLock<Arc<TierConfig>>,
    audit: AuditOutbox,
    locks: UserLocks,
    stream: broadcast::Sender<PointsTransaction>,
    options: ServiceOptions,
}

impl PointsService {
    pub fn new(store: Arc<dyn LedgerStore>, tiers: TierConfig, audit: AuditOutbox, options: ServiceOptions) -> Self {
        let (stream, _) = broadcast::channel(options.stream_capacity.max(1));
        Self { store, tiers: RwLock::new(Arc::new(tiers)), audit, locks: UserLocks::default(), stream, options }
    }

    pub fn tier_config(&self) -> Arc<TierConfig> {
        self.tiers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Takes effect on the next mutation; stored tiers are not recomputed.
    pub fn replace_tier_config(&self, tiers: TierConfig) {
        *self.tiers.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tiers);
        tracing::info!("tier thresholds replaced");
    }

    /// Live feed of committed ledger entries for admin dashboards.
    pub fn subscribe(&self) -> broadcast::Receiver<PointsTransaction> { self.stream.subscribe() }

    pub async fn flush_audit(&self) -> std::result::Result<(), AuditError> { self.audit.flush().await }

    pub async fn ping(&self) -> Result<()> { self.bounded("ping", self.store.ping()).await }

    pub async fn get_user_points(&self, user_id: &UserId) -> Result<PointsSnapshot> {
        self.bounded("get_snapshot", self.store.get_snapshot(user_id)).await
    }

    pub async fn get_points_transactions(&self, user_id: &UserId, page: PageRequest) -> Result<TransactionPage> {
        self.bounded("list_transactions", self.store.list_transactions(user_id, page)).await
    }

    pub async fn recent_transactions(&self, limit: u32) -> Result<Vec<PointsTransaction>> {
        let limit = PageRequest::first(limit).limit;
        self.bounded("list_recent_transactions", self.store.list_recent_transactions(limit)).await
    }

    pub async fn tier_progress(&self, user_id: &UserId) -> Result<TierProgress> {
        let snapshot = self.get_user_points(user_id).await?;
        Ok(self.tier_config().progress(snapshot.current_balance))
    }

    pub async fn add_points(&self, user_id: &UserId, amount: i64, reason: Reason, admin_id: Option<AdminId>) -> Result<PointsTransaction> {
        self.apply(user_id, PointsChange::Earn { amount }, reason, admin_id).await
    }

    /// Fails with `InsufficientBalance` and writes nothing when `amount`
    /// exceeds the current balance.
    pub async fn subtract_points(&self, user_id: &UserId, amount: i64, reason: Reason, admin_id: Option<AdminId>) -> Result<PointsTransaction> {
        self.apply(user_id, PointsChange::Spend { amount }, reason, admin_id).await
    }

    pub async fn set_points(&self, user_id: &UserId, new_balance: i64, reason: Reason, admin_id: AdminId) -> Result<PointsTransaction> {
        self.apply(user_id, PointsChange::AdminAdjustment { new_balance, admin_id }, reason, None).await
    }

    /// Credits points for a paid order at the user's current tier multiplier.
    /// An order is credited at most once per user: replaying it returns the
    /// original entry. Returns `None` when the order is too small to earn
    /// anything.
    pub async fn award_purchase_points(&self, user_id: &UserId, order_id: &str, order_total: Decimal) -> Result<Option<PointsTransaction>> {
        let order_id = OrderId::new(order_id)?;
        let reason = Reason::new(format!("purchase {order_id}"))?;
        let _guard = self.locks.acquire(user_id).await;

        if let Some(existing) = self.order_transaction(user_id, &order_id).await? {
            tracing::info!(%user_id, %order_id, sequence = existing.sequence, "order already credited");
            return Ok(Some(existing));
        }
        let snapshot = self.bounded("get_snapshot", self.store.get_snapshot(user_id)).await?;
        if self.tier_config().points_for_purchase(order_total, snapshot.tier)? == 0 {
            tracing::debug!(%user_id, %order_id, %order_total, "order earns no points");
            return Ok(None);
        }

        let plan = |snapshot: &PointsSnapshot, tiers: &TierConfig| -> Result<PointsChange> {
            let amount = tiers.points_for_purchase(order_total, snapshot.tier)?;
            Ok(PointsChange::Purchase { order_id: order_id.clone(), amount })
        };
        match self.commit_locked(user_id, &reason, None, plan).await {
            // Another process credited it first.
            Err(e @ LoyaltyError::Store(StoreError::DuplicateOrder { .. })) => {
                self.order_transaction(user_id, &order_id).await?.map(Some).ok_or(e)
            }
            other => other.map(Some),
        }
    }

    /// Read-modify-write of one user's snapshot. Serialized per user in this
    /// process; the store's version check catches writers elsewhere.
    pub async fn apply(&self, user_id: &UserId, change: PointsChange, reason: Reason, admin_id: Option<AdminId>) -> Result<PointsTransaction> {
        let _guard = self.locks.acquire(user_id).await;
        self.commit_locked(user_id, &reason, admin_id.as_ref(), |_, _| Ok(change.clone())).await
    }

    /// The caller holds the user's lock. `plan` runs against a freshly read
    /// snapshot on every attempt.
    async fn commit_locked<P>(&self, user_id: &UserId, reason: &Reason, admin_id: Option<&AdminId>, plan: P) -> Result<PointsTransaction>
    where
        P: Fn(&PointsSnapshot, &TierConfig) -> Result<PointsChange>,
    {
        let attempts = self.options.max_conflict_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let snapshot = self.bounded("get_snapshot", self.store.get_snapshot(user_id)).await?;
            let tiers = self.tier_config();
            let change = plan(&snapshot, &tiers)?;
            let mut account = PointsAccount::new(snapshot);
            let expected = account.version();
            let transaction = account
                .apply(&change, reason, admin_id, &tiers, Utc::now())
                .map_err(|e| {
                    tracing::info!(%user_id, kind = %change.kind(), error = %e, "points change rejected");
                    LoyaltyError::from(e)
                })?;
            let events = account.take_events();
            let snapshot = account.into_snapshot();

            match self.bounded("commit", self.store.commit(&snapshot, &transaction, expected)).await {
                Ok(()) => {
                    tracing::debug!(%user_id, sequence = transaction.sequence, amount = transaction.amount, balance = snapshot.current_balance, "points committed");
                    self.publish(&transaction, events);
                    return Ok(transaction);
                }
                Err(LoyaltyError::Store(StoreError::VersionConflict { actual, .. })) => {
                    tracing::warn!(%user_id, expected, actual, attempt, "snapshot changed underneath, retrying");
                }
                Err(LoyaltyError::Store(StoreError::OutOfOrder { sequence, .. })) => {
                    tracing::warn!(%user_id, sequence, attempt, "ledger moved underneath, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LoyaltyError::ConcurrentModification { user_id: user_id.clone(), attempts })
    }

    async fn order_transaction(&self, user_id: &UserId, order_id: &OrderId) -> Result<Option<PointsTransaction>> {
        self.bounded("find_order_transaction", self.store.find_order_transaction(user_id, order_id)).await
    }

    fn publish(&self, transaction: &PointsTransaction, events: Vec<PointsEvent>) {
        for event in events {
            match event {
                PointsEvent::TierChanged { user_id, from, to } => {
                    tracing::info!(%user_id, %from, %to, "tier changed");
                }
                other => self.audit.enqueue(other),
            }
        }
        // No subscribers is fine.
        let _ = self.stream.send(transaction.clone());
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        let after = self.options.store_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if !matches!(e, StoreError::VersionConflict { .. } | StoreError::OutOfOrder { .. } | StoreError::DuplicateOrder { .. }) {
                    tracing::error!(operation, error = %e, "ledger store call failed");
                }
                Err(e.into())
            }
            Err(_) => {
                tracing::error!(operation, ?after, "ledger store call timed out");
                Err(LoyaltyError::Timeout { operation, after })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryActivityLog;
    use crate::domain::aggregates::TransactionType;
    use crate::domain::rules::Tier;
    use crate::store::MemoryLedgerStore;
    use crate::{ErrorKind, LedgerError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn user() -> UserId { UserId::new("u1").unwrap() }
    fn reason(r: &str) -> Reason { Reason::new(r).unwrap() }

    fn service_on(store: Arc<dyn LedgerStore>, options: ServiceOptions) -> (PointsService, Arc<MemoryActivityLog>) {
        let sink = Arc::new(MemoryActivityLog::new());
        let (outbox, _worker) = AuditOutbox::spawn(sink.clone(), 64);
        (PointsService::new(store, TierConfig::default(), outbox, options), sink)
    }

    /// Forwards to a memory store but reports a conflict on the first `n` commits.
    struct ConflictingStore {
        inner: MemoryLedgerStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait]
    impl LedgerStore for ConflictingStore {
        async fn get_snapshot(&self, user_id: &UserId) -> std::result::Result<PointsSnapshot, StoreError> { self.inner.get_snapshot(user_id).await }
        async fn write_snapshot(&self, s: &PointsSnapshot, v: i64) -> std::result::Result<(), StoreError> { self.inner.write_snapshot(s, v).await }
        async fn append_transaction(&self, t: &PointsTransaction) -> std::result::Result<Uuid, StoreError> { self.inner.append_transaction(t).await }
        async fn commit(&self, s: &PointsSnapshot, t: &PointsTransaction, v: i64) -> std::result::Result<(), StoreError> {
            if self.conflicts_left.load(Ordering::SeqCst) > 0 {
                self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::VersionConflict { user_id: s.user_id.clone(), expected: v, actual: v + 1 });
            }
            self.inner.commit(s, t, v).await
        }
        async fn list_transactions(&self, u: &UserId, p: PageRequest) -> std::result::Result<TransactionPage, StoreError> { self.inner.list_transactions(u, p).await }
        async fn find_order_transaction(&self, u: &UserId, o: &OrderId) -> std::result::Result<Option<PointsTransaction>, StoreError> { self.inner.find_order_transaction(u, o).await }
        async fn list_recent_transactions(&self, l: u32) -> std::result::Result<Vec<PointsTransaction>, StoreError> { self.inner.list_recent_transactions(l).await }
        async fn ping(&self) -> std::result::Result<(), StoreError> { self.inner.ping().await }
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let store = Arc::new(ConflictingStore { inner: MemoryLedgerStore::new(), conflicts_left: AtomicU32::new(2) });
        let (svc, _) = service_on(store, ServiceOptions::default());
        let tx = svc.add_points(&user(), 10, reason("bonus"), None).await.unwrap();
        assert_eq!(tx.balance_after, 10);
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_retries() {
        let store = Arc::new(ConflictingStore { inner: MemoryLedgerStore::new(), conflicts_left: AtomicU32::new(10) });
        let (svc, _) = service_on(store, ServiceOptions { max_conflict_retries: 1, ..ServiceOptions::default() });
        let err = svc.add_points(&user(), 10, reason("bonus"), None).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::ConcurrentModification { attempts: 2, .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryLedgerStore::with_latency(Duration::from_millis(200)));
        let (svc, _) = service_on(store, ServiceOptions { store_timeout: Duration::from_millis(20), ..ServiceOptions::default() });
        let err = svc.get_user_points(&user()).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::Timeout { operation: "get_snapshot", .. }));
    }

    #[tokio::test]
    async fn test_store_outage_propagates() {
        let store = Arc::new(MemoryLedgerStore::new());
        let (svc, _) = service_on(store.clone(), ServiceOptions::default());
        store.set_available(false);
        let err = svc.add_points(&user(), 5, reason("bonus"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_admin_attributed_earn_is_audited() {
        let (svc, sink) = service_on(Arc::new(MemoryLedgerStore::new()), ServiceOptions::default());
        let admin = AdminId::new("A1").unwrap();
        let tx = svc.add_points(&user(), 25, reason("goodwill"), Some(admin.clone())).await.unwrap();
        assert_eq!((tx.kind, tx.admin_id), (TransactionType::Earn, Some(admin)));
        svc.flush_audit().await.unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], PointsEvent::Earned { amount: 25, .. }));
        assert!(matches!(records[1], PointsEvent::AdminChanged { old_value: 0, new_value: 25, .. }));
    }

    #[tokio::test]
    async fn test_purchase_uses_tier_multiplier() {
        let (svc, _) = service_on(Arc::new(MemoryLedgerStore::new()), ServiceOptions::default());
        svc.add_points(&user(), 1_000, reason("welcome"), None).await.unwrap();
        let tx = svc.award_purchase_points(&user(), "ORD-1", Decimal::new(200, 0)).await.unwrap().unwrap();
        assert_eq!(tx.amount, 250);
        assert_eq!(tx.reason.as_str(), "purchase ORD-1");
        assert!(svc.award_purchase_points(&user(), "ORD-2", Decimal::new(5, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replayed_order_is_credited_once() {
        let (svc, _) = service_on(Arc::new(MemoryLedgerStore::new()), ServiceOptions::default());
        let first = svc.award_purchase_points(&user(), "ORD-1", Decimal::new(100, 0)).await.unwrap().unwrap();
        let replay = svc.award_purchase_points(&user(), "ORD-1", Decimal::new(100, 0)).await.unwrap().unwrap();
        assert_eq!(replay, first);
        assert_eq!(svc.get_user_points(&user()).await.unwrap().current_balance, 100);

        svc.award_purchase_points(&user(), "ORD-2", Decimal::new(100, 0)).await.unwrap().unwrap();
        assert_eq!(svc.get_user_points(&user()).await.unwrap().current_balance, 200);
    }

    #[tokio::test]
    async fn test_concurrent_replays_credit_once() {
        let (svc, _) = service_on(Arc::new(MemoryLedgerStore::new()), ServiceOptions::default());
        let svc = Arc::new(svc);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.award_purchase_points(&user(), "ORD-9", Decimal::new(40, 0)).await })
            })
            .collect();
        let mut ids = Vec::new();
        for t in tasks { ids.push(t.await.unwrap().unwrap().unwrap().transaction_id); }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(svc.get_user_points(&user()).await.unwrap().current_balance, 40);
    }

    #[tokio::test]
    async fn test_order_total_overflow_is_rejected() {
        let (svc, _) = service_on(Arc::new(MemoryLedgerStore::new()), ServiceOptions::default());
        svc.add_points(&user(), 1_000, reason("welcome"), None).await.unwrap();
        let err = svc.award_purchase_points(&user(), "ORD-X", Decimal::MAX).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::Rules(crate::RulesError::PurchaseOverflow(_))));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(svc.get_user_points(&user()).await.unwrap().current_balance, 1_000);
    }

    #[tokio::test]
    async fn test_new_thresholds_apply_on_next_mutation() {
        let (svc, _) = service_on(Arc::new(MemoryLedgerStore::new()), ServiceOptions::default());
        svc.add_points(&user(), 600, reason("bonus"), None).await.unwrap();
        let lowered = TierConfig::new(
            vec![
                crate::TierThreshold::new(Tier::Bronze, 0, Decimal::ONE),
                crate::TierThreshold::new(Tier::Silver, 500, Decimal::ONE),
            ],
            Decimal::ONE,
        ).unwrap();
        svc.replace_tier_config(lowered);
        assert_eq!(svc.get_user_points(&user()).await.unwrap().tier, Tier::Bronze);
        svc.add_points(&user(), 1, reason("nudge"), None).await.unwrap();
        assert_eq!(svc.get_user_points(&user()).await.unwrap().tier, Tier::Silver);
    }

    #[tokio::test]
    async fn test_rejected_change_is_not_streamed() {
        let (svc, _) = service_on(Arc::new(MemoryLedgerStore::new()), ServiceOptions::default());
        let mut feed = svc.subscribe();
        let err = svc.subtract_points(&user(), 1, reason("redeem"), None).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::Ledger(LedgerError::InsufficientBalance { .. })));
        svc.add_points(&user(), 3, reason("bonus"), None).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().amount, 3);
    }
}
