//! Domain events
use crate::domain::rules::Tier;
use crate::domain::value_objects::{AdminId, Reason, UserId};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PointsEvent {
    Earned { user_id: UserId, amount: i64, reason: Reason },
    Spent { user_id: UserId, amount: i64, reason: Reason },
    AdminChanged { user_id: UserId, field: &'static str, old_value: i64, new_value: i64, admin_id: AdminId, reason: Reason },
    TierChanged { user_id: UserId, from: Tier, to: Tier },
}
