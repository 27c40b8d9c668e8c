//! Points Account Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::transaction::{PointsTransaction, TransactionType};
use crate::domain::events::PointsEvent;
use crate::domain::rules::{Tier, TierConfig};
use crate::domain::value_objects::{AdminId, OrderId, Reason, UserId};

/// Current-state record of a user's points. `current_balance` always equals
/// `total_earned - total_spent`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsSnapshot {
    pub user_id: UserId,
    pub current_balance: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub tier: Tier,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

impl PointsSnapshot {
    pub fn zero(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self { user_id, current_balance: 0, total_earned: 0, total_spent: 0, tier: Tier::Bronze, version: 0, last_updated: now }
    }

    pub fn is_balanced(&self) -> bool {
        self.total_earned.checked_sub(self.total_spent) == Some(self.current_balance)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PointsChange {
    Earn { amount: i64 },
    Spend { amount: i64 },
    AdminAdjustment { new_balance: i64, admin_id: AdminId },
    /// An earn credited for a storefront order.
    Purchase { order_id: OrderId, amount: i64 },
}

impl PointsChange {
    pub fn kind(&self) -> TransactionType {
        match self {
            Self::Earn { .. } | Self::Purchase { .. } => TransactionType::Earn,
            Self::Spend { .. } => TransactionType::Spend,
            Self::AdminAdjustment { .. } => TransactionType::AdminAdjustment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("points amount must be positive, got {0}")]
    NonPositiveAmount(i64),
    #[error("insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance { available: i64, requested: i64 },
    #[error("balance must not be negative, got {0}")]
    NegativeBalance(i64),
    #[error("points arithmetic overflowed")]
    Overflow,
}

#[derive(Clone, Debug)]
pub struct PointsAccount {
    snapshot: PointsSnapshot,
    events: Vec<PointsEvent>,
}

impl PointsAccount {
    pub fn new(snapshot: PointsSnapshot) -> Self { Self { snapshot, events: vec![] } }

    pub fn snapshot(&self) -> &PointsSnapshot { &self.snapshot }
    pub fn version(&self) -> i64 { self.snapshot.version }
    pub fn balance(&self) -> i64 { self.snapshot.current_balance }

    /// Applies one change and returns the ledger entry it produced. On error
    /// the account is left untouched.
    pub fn apply(
        &mut self,
        change: &PointsChange,
        reason: &Reason,
        admin_id: Option<&AdminId>,
        tiers: &TierConfig,
        now: DateTime<Utc>,
    ) -> Result<PointsTransaction, LedgerError> {
        let before = self.snapshot.current_balance;
        let (amount, earned, spent) = match change {
            PointsChange::Earn { amount } | PointsChange::Purchase { amount, .. } => {
                ensure_positive(*amount)?;
                (*amount, *amount, 0)
            }
            PointsChange::Spend { amount } => {
                ensure_positive(*amount)?;
                if before < *amount {
                    return Err(LedgerError::InsufficientBalance { available: before, requested: *amount });
                }
                (-*amount, 0, *amount)
            }
            PointsChange::AdminAdjustment { new_balance, .. } => {
                if *new_balance < 0 { return Err(LedgerError::NegativeBalance(*new_balance)); }
                let diff = new_balance.checked_sub(before).ok_or(LedgerError::Overflow)?;
                (diff, diff.max(0), (-diff).max(0))
            }
        };

        let after = before.checked_add(amount).ok_or(LedgerError::Overflow)?;
        let total_earned = self.snapshot.total_earned.checked_add(earned).ok_or(LedgerError::Overflow)?;
        let total_spent = self.snapshot.total_spent.checked_add(spent).ok_or(LedgerError::Overflow)?;
        let version = self.snapshot.version.checked_add(1).ok_or(LedgerError::Overflow)?;
        let old_tier = self.snapshot.tier;
        let new_tier = tiers.calculate_tier(after).tier;

        let attributed = match change {
            PointsChange::AdminAdjustment { admin_id, .. } => Some(admin_id.clone()),
            _ => admin_id.cloned(),
        };
        let user_id = self.snapshot.user_id.clone();
        let transaction = PointsTransaction {
            transaction_id: Uuid::now_v7(),
            user_id: user_id.clone(),
            sequence: version,
            amount,
            kind: change.kind(),
            reason: reason.clone(),
            balance_before: before,
            balance_after: after,
            timestamp: now,
            admin_id: attributed.clone(),
            order_id: match change {
                PointsChange::Purchase { order_id, .. } => Some(order_id.clone()),
                _ => None,
            },
        };

        self.snapshot = PointsSnapshot {
            user_id: user_id.clone(), current_balance: after, total_earned, total_spent,
            tier: new_tier, version, last_updated: now,
        };

        match change {
            PointsChange::Earn { amount } | PointsChange::Purchase { amount, .. } => self.raise_event(PointsEvent::Earned { user_id: user_id.clone(), amount: *amount, reason: reason.clone() }),
            PointsChange::Spend { amount } => self.raise_event(PointsEvent::Spent { user_id: user_id.clone(), amount: *amount, reason: reason.clone() }),
            PointsChange::AdminAdjustment { .. } => {}
        }
        if let Some(admin_id) = attributed {
            self.raise_event(PointsEvent::AdminChanged {
                user_id: user_id.clone(), field: "points", old_value: before, new_value: after, admin_id, reason: reason.clone(),
            });
        }
        if old_tier != new_tier {
            self.raise_event(PointsEvent::TierChanged { user_id, from: old_tier, to: new_tier });
        }
        Ok(transaction)
    }

    pub fn take_events(&mut self) -> Vec<PointsEvent> { std::mem::take(&mut self.events) }
    pub fn into_snapshot(self) -> PointsSnapshot { self.snapshot }
    fn raise_event(&mut self, e: PointsEvent) { self.events.push(e); }
}

fn ensure_positive(amount: i64) -> Result<(), LedgerError> {
    if amount <= 0 { Err(LedgerError::NonPositiveAmount(amount)) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> PointsAccount { PointsAccount::new(PointsSnapshot::zero(UserId::new("u1").unwrap(), Utc::now())) }
    fn reason(r: &str) -> Reason { Reason::new(r).unwrap() }

    #[test]
    fn test_earn_then_spend() {
        let tiers = TierConfig::default();
        let mut acct = account();
        let tx = acct.apply(&PointsChange::Earn { amount: 1_100 }, &reason("purchase"), None, &tiers, Utc::now()).unwrap();
        assert_eq!((tx.sequence, tx.balance_before, tx.balance_after, tx.kind), (1, 0, 1_100, TransactionType::Earn));
        assert_eq!(acct.snapshot().tier, Tier::Silver);

        let tx = acct.apply(&PointsChange::Spend { amount: 200 }, &reason("redeem"), None, &tiers, Utc::now()).unwrap();
        assert_eq!((tx.amount, tx.balance_after), (-200, 900));
        let snap = acct.snapshot();
        assert_eq!((snap.total_earned, snap.total_spent, snap.version, snap.tier), (1_100, 200, 2, Tier::Bronze));
        assert!(snap.is_balanced());
    }

    #[test]
    fn test_overdraw_leaves_account_untouched() {
        let tiers = TierConfig::default();
        let mut acct = account();
        acct.apply(&PointsChange::Earn { amount: 50 }, &reason("bonus"), None, &tiers, Utc::now()).unwrap();
        acct.take_events();
        let before = acct.snapshot().clone();
        let err = acct.apply(&PointsChange::Spend { amount: 51 }, &reason("redeem"), None, &tiers, Utc::now()).unwrap_err();
        assert_eq!(err, LedgerError::InsufficientBalance { available: 50, requested: 51 });
        assert_eq!(acct.snapshot(), &before);
        assert!(acct.take_events().is_empty());
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        let tiers = TierConfig::default();
        let mut acct = account();
        assert_eq!(acct.apply(&PointsChange::Earn { amount: 0 }, &reason("x"), None, &tiers, Utc::now()), Err(LedgerError::NonPositiveAmount(0)));
        assert_eq!(acct.apply(&PointsChange::Spend { amount: -3 }, &reason("x"), None, &tiers, Utc::now()), Err(LedgerError::NonPositiveAmount(-3)));
    }

    #[test]
    fn test_admin_adjustment_keeps_totals_balanced() {
        let tiers = TierConfig::default();
        let admin = AdminId::new("A1").unwrap();
        let mut acct = account();
        acct.apply(&PointsChange::Earn { amount: 1_100 }, &reason("purchase"), None, &tiers, Utc::now()).unwrap();
        acct.take_events();

        let change = PointsChange::AdminAdjustment { new_balance: 0, admin_id: admin.clone() };
        let tx = acct.apply(&change, &reason("correction"), None, &tiers, Utc::now()).unwrap();
        assert_eq!((tx.amount, tx.kind, tx.admin_id.as_ref()), (-1_100, TransactionType::AdminAdjustment, Some(&admin)));
        let snap = acct.snapshot();
        assert_eq!((snap.current_balance, snap.total_earned, snap.total_spent), (0, 1_100, 1_100));
        assert!(snap.is_balanced());

        let events = acct.take_events();
        assert!(events.iter().any(|e| matches!(e, PointsEvent::AdminChanged { old_value: 1_100, new_value: 0, .. })));
        assert!(events.iter().any(|e| matches!(e, PointsEvent::TierChanged { from: Tier::Silver, to: Tier::Bronze, .. })));
    }

    #[test]
    fn test_raising_balance_counts_as_earned() {
        let tiers = TierConfig::default();
        let mut acct = account();
        acct.apply(&PointsChange::Earn { amount: 80 }, &reason("earn"), None, &tiers, Utc::now()).unwrap();
        acct.apply(&PointsChange::Spend { amount: 30 }, &reason("spend"), None, &tiers, Utc::now()).unwrap();

        let change = PointsChange::AdminAdjustment { new_balance: 500, admin_id: AdminId::new("A2").unwrap() };
        let tx = acct.apply(&change, &reason("migration"), None, &tiers, Utc::now()).unwrap();
        assert_eq!((tx.amount, tx.balance_before, tx.balance_after), (450, 50, 500));
        let snap = acct.snapshot();
        assert_eq!((snap.total_earned, snap.total_spent), (530, 30));
        assert!(snap.is_balanced());
    }

    #[test]
    fn test_unchanged_balance_is_still_ledgered() {
        let tiers = TierConfig::default();
        let admin = AdminId::new("A1").unwrap();
        let mut acct = account();
        acct.apply(&PointsChange::Earn { amount: 40 }, &reason("earn"), None, &tiers, Utc::now()).unwrap();
        acct.take_events();
        let before = acct.snapshot().clone();

        let change = PointsChange::AdminAdjustment { new_balance: 40, admin_id: admin.clone() };
        let tx = acct.apply(&change, &reason("audit check"), None, &tiers, Utc::now()).unwrap();
        assert_eq!((tx.amount, tx.kind, tx.sequence), (0, TransactionType::AdminAdjustment, 2));
        assert_eq!(tx.admin_id, Some(admin));
        let snap = acct.snapshot();
        assert_eq!((snap.current_balance, snap.total_earned, snap.total_spent), (40, 40, 0));
        assert_eq!(snap.version, before.version + 1);
        let events = acct.take_events();
        assert!(matches!(events.as_slice(), [PointsEvent::AdminChanged { old_value: 40, new_value: 40, .. }]));
    }

    #[test]
    fn test_purchase_earns_and_keeps_order() {
        let order = OrderId::new("ORD-1").unwrap();
        let mut acct = account();
        let change = PointsChange::Purchase { order_id: order.clone(), amount: 125 };
        let tx = acct.apply(&change, &reason("purchase ORD-1"), None, &TierConfig::default(), Utc::now()).unwrap();
        assert_eq!((tx.kind, tx.amount, tx.order_id), (TransactionType::Earn, 125, Some(order)));
        assert_eq!(acct.snapshot().total_earned, 125);
        assert!(matches!(acct.take_events().as_slice(), [PointsEvent::Earned { amount: 125, .. }]));
    }

    #[test]
    fn test_negative_target_rejected() {
        let change = PointsChange::AdminAdjustment { new_balance: -1, admin_id: AdminId::new("A1").unwrap() };
        let err = account().apply(&change, &reason("oops"), None, &TierConfig::default(), Utc::now()).unwrap_err();
        assert_eq!(err, LedgerError::NegativeBalance(-1));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let tiers = TierConfig::default();
        let mut acct = account();
        acct.apply(&PointsChange::Earn { amount: i64::MAX }, &reason("max"), None, &tiers, Utc::now()).unwrap();
        assert_eq!(acct.apply(&PointsChange::Earn { amount: 1 }, &reason("one more"), None, &tiers, Utc::now()), Err(LedgerError::Overflow));
    }
}
