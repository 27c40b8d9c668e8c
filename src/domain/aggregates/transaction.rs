//! Ledger transaction record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use crate::domain::value_objects::{AdminId, OrderId, Reason, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType { Earn, Spend, AdminAdjustment }

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Earn => "earn", Self::Spend => "spend", Self::AdminAdjustment => "admin_adjustment" }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for TransactionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earn" => Ok(Self::Earn),
            "spend" => Ok(Self::Spend),
            "admin_adjustment" => Ok(Self::AdminAdjustment),
            other => Err(format!("unknown transaction type `{other}`")),
        }
    }
}

/// One append-only ledger entry. `sequence` starts at 1 for each user and
/// equals the snapshot version this entry produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsTransaction {
    pub transaction_id: Uuid,
    pub user_id: UserId,
    pub sequence: i64,
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub reason: Reason,
    pub balance_before: i64,
    pub balance_after: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<AdminId>,
    /// Set on purchase awards; unique per user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
}

impl PointsTransaction {
    pub fn is_consistent(&self) -> bool {
        self.balance_before.checked_add(self.amount) == Some(self.balance_after)
    }

    /// Whether this entry may directly follow `prev` in the user's ledger.
    pub fn extends(&self, prev: Option<&PointsTransaction>) -> bool {
        match prev {
            None => self.sequence == 1 && self.balance_before == 0,
            Some(p) => self.sequence == p.sequence + 1 && self.balance_before == p.balance_after,
        }
    }
}
