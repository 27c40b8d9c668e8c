use serde::Serialize;

use super::PointsService;
use crate::domain::aggregates::{PointsSnapshot, PointsTransaction};
use crate::domain::rules::Tier;
use crate::domain::value_objects::{PageRequest, UserId};
use crate::Result;

const RECONCILE_PAGE: u32 = 200;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// An entry whose own arithmetic is wrong.
    EntryDoesNotAddUp { sequence: i64 },
    SequenceGap { after: i64, found: i64 },
    BrokenChain { sequence: i64, balance_before: i64, previous_balance_after: i64 },
    /// The oldest entry does not start from an empty account.
    MissingGenesis { oldest_sequence: i64, balance_before: i64 },
    BalanceMismatch { snapshot: i64, ledger: i128 },
    TotalsMismatch { snapshot_earned: i64, ledger_earned: i128, snapshot_spent: i64, ledger_spent: i128 },
    VersionMismatch { snapshot: i64, entries: i64 },
    /// Informational: thresholds changed since the last mutation.
    StaleTier { stored: Tier, computed: Tier },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub snapshot: PointsSnapshot,
    pub entries: i64,
    pub ledger_balance: i128,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    /// True when the snapshot and the ledger agree. A stale tier alone does
    /// not count against consistency.
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.iter().all(|d| matches!(d, Discrepancy::StaleTier { .. }))
    }
}

#[derive(Default)]
struct Walk {
    entries: i64,
    sum: i128,
    earned: i128,
    spent: i128,
    newer: Option<PointsTransaction>,
    discrepancies: Vec<Discrepancy>,
}

impl Walk {
    /// Entries arrive newest first; each is checked against the one after it.
    fn visit(&mut self, tx: PointsTransaction) {
        self.entries += 1;
        self.sum += i128::from(tx.amount);
        if tx.amount > 0 { self.earned += i128::from(tx.amount); } else { self.spent -= i128::from(tx.amount); }
        if !tx.is_consistent() {
            self.discrepancies.push(Discrepancy::EntryDoesNotAddUp { sequence: tx.sequence });
        }
        if let Some(newer) = &self.newer {
            if newer.sequence != tx.sequence + 1 {
                self.discrepancies.push(Discrepancy::SequenceGap { after: tx.sequence, found: newer.sequence });
            }
            if newer.balance_before != tx.balance_after {
                self.discrepancies.push(Discrepancy::BrokenChain {
                    sequence: newer.sequence, balance_before: newer.balance_before, previous_balance_after: tx.balance_after,
                });
            }
        }
        self.newer = Some(tx);
    }

    fn finish(mut self, snapshot: PointsSnapshot, computed_tier: Tier) -> ReconciliationReport {
        if let Some(oldest) = &self.newer {
            if oldest.sequence != 1 || oldest.balance_before != 0 {
                self.discrepancies.push(Discrepancy::MissingGenesis { oldest_sequence: oldest.sequence, balance_before: oldest.balance_before });
            }
        }
        if i128::from(snapshot.current_balance) != self.sum {
            self.discrepancies.push(Discrepancy::BalanceMismatch { snapshot: snapshot.current_balance, ledger: self.sum });
        }
        if i128::from(snapshot.total_earned) != self.earned || i128::from(snapshot.total_spent) != self.spent {
            self.discrepancies.push(Discrepancy::TotalsMismatch {
                snapshot_earned: snapshot.total_earned, ledger_earned: self.earned,
                snapshot_spent: snapshot.total_spent, ledger_spent: self.spent,
            });
        }
        if snapshot.version != self.entries {
            self.discrepancies.push(Discrepancy::VersionMismatch { snapshot: snapshot.version, entries: self.entries });
        }
        if snapshot.tier != computed_tier {
            self.discrepancies.push(Discrepancy::StaleTier { stored: snapshot.tier, computed: computed_tier });
        }
        ReconciliationReport { snapshot, entries: self.entries, ledger_balance: self.sum, discrepancies: self.discrepancies }
    }
}

impl PointsService {
    /// Walks the user's whole ledger one page at a time and compares it with
    /// the snapshot.
    pub async fn reconcile(&self, user_id: &UserId) -> Result<ReconciliationReport> {
        let _guard = self.locks.acquire(user_id).await;
        let snapshot = self.bounded("get_snapshot", self.store.get_snapshot(user_id)).await?;
        let mut walk = Walk::default();
        let mut page = PageRequest::first(RECONCILE_PAGE);
        loop {
            let batch = self.bounded("list_transactions", self.store.list_transactions(user_id, page)).await?;
            for tx in batch.transactions { walk.visit(tx); }
            match batch.next_cursor {
                Some(cursor) => page = PageRequest::new(Some(cursor), Some(RECONCILE_PAGE)),
                None => break,
            }
        }

        let computed = self.tier_config().calculate_tier(snapshot.current_balance).tier;
        let report = walk.finish(snapshot, computed);
        if report.is_consistent() {
            tracing::debug!(%user_id, entries = report.entries, "ledger reconciled");
        } else {
            tracing::warn!(%user_id, discrepancies = ?report.discrepancies, "ledger and snapshot disagree");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOutbox, MemoryActivityLog};
    use crate::domain::value_objects::{AdminId, Reason};
    use crate::service::ServiceOptions;
    use crate::store::{LedgerStore, MemoryLedgerStore};
    use crate::TierConfig;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    fn setup() -> (PointsService, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let (outbox, _worker) = AuditOutbox::spawn(Arc::new(MemoryActivityLog::new()), 16);
        (PointsService::new(store.clone(), TierConfig::default(), outbox, ServiceOptions::default()), store)
    }

    #[tokio::test]
    async fn test_clean_ledger_reconciles() {
        let (svc, _) = setup();
        let user = UserId::new("u1").unwrap();
        for i in 0..450 {
            svc.add_points(&user, 10, Reason::new(format!("visit {i}")).unwrap(), None).await.unwrap();
        }
        svc.subtract_points(&user, 500, Reason::new("redeem").unwrap(), None).await.unwrap();
        svc.set_points(&user, 7, Reason::new("correction").unwrap(), AdminId::new("A1").unwrap()).await.unwrap();

        let report = svc.reconcile(&user).await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.discrepancies);
        assert_eq!((report.entries, report.ledger_balance), (452, 7));
    }

    #[tokio::test]
    async fn test_snapshot_drift_is_reported() {
        let (svc, store) = setup();
        let user = UserId::new("u1").unwrap();
        svc.add_points(&user, 100, Reason::new("bonus").unwrap(), None).await.unwrap();

        // A snapshot write that skipped the ledger.
        let mut drifted = store.get_snapshot(&user).await.unwrap();
        drifted.current_balance = 150;
        drifted.total_earned = 150;
        drifted.version = 2;
        drifted.last_updated = Utc::now();
        store.write_snapshot(&drifted, 1).await.unwrap();

        let report = svc.reconcile(&user).await.unwrap();
        assert!(!report.is_consistent());
        assert!(report.discrepancies.contains(&Discrepancy::BalanceMismatch { snapshot: 150, ledger: 100 }));
        assert!(report.discrepancies.contains(&Discrepancy::VersionMismatch { snapshot: 2, entries: 1 }));
    }

    #[tokio::test]
    async fn test_orphan_entry_is_reported() {
        let (svc, store) = setup();
        let user = UserId::new("u1").unwrap();
        let tx = svc.add_points(&user, 40, Reason::new("bonus").unwrap(), None).await.unwrap();

        // Ledger append that never reached the snapshot.
        let orphan = PointsTransaction { transaction_id: Uuid::now_v7(), sequence: 2, balance_before: 40, balance_after: 50, amount: 10, ..tx };
        store.append_transaction(&orphan).await.unwrap();

        let report = svc.reconcile(&user).await.unwrap();
        assert!(report.discrepancies.contains(&Discrepancy::BalanceMismatch { snapshot: 40, ledger: 50 }));
    }
}
