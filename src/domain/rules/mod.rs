//! Loyalty rules: tier thresholds and purchase earning

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier { Bronze, Silver, Gold, Platinum }

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Bronze => "bronze", Self::Silver => "silver", Self::Gold => "gold", Self::Platinum => "platinum" }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Tier {
    type Err = RulesError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(Self::Bronze),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            "platinum" => Ok(Self::Platinum),
            other => Err(RulesError::UnknownTier(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    #[error("unknown tier `{0}`")]
    UnknownTier(String),
    #[error("tier table is empty")]
    Empty,
    #[error("lowest tier must start at 0 points, found {0}")]
    NoFloor(i64),
    #[error("tier `{0}` is out of order")]
    OutOfOrder(Tier),
    #[error("tier `{0}` has a non-positive points multiplier")]
    BadMultiplier(Tier),
    #[error("points per currency unit must not be negative")]
    NegativeEarnRate,
    #[error("order total {0} earns more points than a balance can hold")]
    PurchaseOverflow(Decimal),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThreshold {
    #[serde(rename = "id")]
    pub tier: Tier,
    #[serde(rename = "minPoints")]
    pub min_points: i64,
    #[serde(rename = "pointsMultiplier", default = "unit_multiplier")]
    pub points_multiplier: Decimal,
}

fn unit_multiplier() -> Decimal { Decimal::ONE }

impl TierThreshold {
    pub fn new(tier: Tier, min_points: i64, points_multiplier: Decimal) -> Self {
        Self { tier, min_points, points_multiplier }
    }
}

/// Ordered tier table. Construct through [`TierConfig::new`] so the table
/// is guaranteed to be a total, monotonic mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    thresholds: Vec<TierThreshold>,
    points_per_currency_unit: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierProgress {
    pub current: Tier,
    pub next: Option<Tier>,
    pub points_to_next: Option<i64>,
}

impl TierConfig {
    pub fn new(mut thresholds: Vec<TierThreshold>, points_per_currency_unit: Decimal) -> Result<Self, RulesError> {
        thresholds.sort_by_key(|t| t.min_points);
        let first = thresholds.first().ok_or(RulesError::Empty)?;
        if first.min_points != 0 { return Err(RulesError::NoFloor(first.min_points)); }
        for pair in thresholds.windows(2) {
            if pair[1].min_points == pair[0].min_points || pair[1].tier <= pair[0].tier {
                return Err(RulesError::OutOfOrder(pair[1].tier));
            }
        }
        if let Some(bad) = thresholds.iter().find(|t| t.points_multiplier <= Decimal::ZERO) {
            return Err(RulesError::BadMultiplier(bad.tier));
        }
        if points_per_currency_unit < Decimal::ZERO { return Err(RulesError::NegativeEarnRate); }
        Ok(Self { thresholds, points_per_currency_unit })
    }

    pub fn thresholds(&self) -> &[TierThreshold] { &self.thresholds }
    pub fn points_per_currency_unit(&self) -> Decimal { self.points_per_currency_unit }

    /// Highest threshold the balance meets. Balances below zero fall back to
    /// the floor tier.
    pub fn calculate_tier(&self, balance: i64) -> &TierThreshold {
        let idx = self.thresholds.partition_point(|t| t.min_points <= balance);
        &self.thresholds[idx.saturating_sub(1)]
    }

    pub fn progress(&self, balance: i64) -> TierProgress {
        let current = self.calculate_tier(balance).tier;
        let next = self.thresholds.iter().find(|t| t.min_points > balance);
        TierProgress {
            current,
            next: next.map(|t| t.tier),
            points_to_next: next.map(|t| t.min_points - balance),
        }
    }

    /// Floor of `order_total * earn rate * tier multiplier`. Totals at or
    /// below zero earn nothing.
    pub fn points_for_purchase(&self, order_total: Decimal, tier: Tier) -> Result<i64, RulesError> {
        if order_total <= Decimal::ZERO { return Ok(0); }
        let multiplier = self.thresholds.iter().find(|t| t.tier == tier).map_or(Decimal::ONE, |t| t.points_multiplier);
        order_total
            .checked_mul(self.points_per_currency_unit)
            .and_then(|v| v.checked_mul(multiplier))
            .and_then(|v| v.floor().to_i64())
            .ok_or(RulesError::PurchaseOverflow(order_total))
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![
                TierThreshold::new(Tier::Bronze, 0, Decimal::ONE),
                TierThreshold::new(Tier::Silver, 1_000, Decimal::new(125, 2)),
                TierThreshold::new(Tier::Gold, 5_000, Decimal::new(15, 1)),
                TierThreshold::new(Tier::Platinum, 10_000, Decimal::TWO),
            ],
            points_per_currency_unit: Decimal::ONE,
        }
    }
}
