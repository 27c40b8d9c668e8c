//! OpenSASE Loyalty
//!
//! Points ledger and tier engine behind the OpenSASE storefront and its
//! back-office.
//!
//! ## Features
//! - Per-user points snapshot with an append-only transaction ledger
//! - Tier classification (bronze, silver, gold, platinum) from configurable thresholds
//! - Admin adjustments with an audit trail
//! - Compare-and-swap snapshot writes with per-user serialization
//! - Ledger reconciliation and a live transaction stream for admin dashboards

pub mod api;
pub mod audit;
pub mod config;
pub mod domain;
pub mod service;
pub mod store;

use std::time::Duration;
use thiserror::Error;

pub use domain::aggregates::{LedgerError, PointsChange, PointsSnapshot, PointsTransaction, TransactionType};
pub use domain::rules::{RulesError, Tier, TierConfig, TierProgress, TierThreshold};
pub use domain::value_objects::{AdminId, OrderId, PageRequest, Reason, UserId, ValueError};
pub use service::{Discrepancy, PointsService, ReconciliationReport, ServiceOptions};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore, StoreError, TransactionPage};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum LoyaltyError {
    #[error(transparent)]
    Invalid(#[from] ValueError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation} timed out after {after:?}; the outcome of an in-flight write is unknown")]
    Timeout { operation: &'static str, after: Duration },

    #[error("gave up on {user_id} after {attempts} conflicting writes")]
    ConcurrentModification { user_id: UserId, attempts: u32 },
}

/// Stable classification callers can branch on without matching the full error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InsufficientBalance,
    Validation,
    Conflict,
    Timeout,
    StoreUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientBalance => "insufficient_balance",
            Self::Validation => "validation_error",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::StoreUnavailable => "store_unavailable",
            Self::Internal => "internal_error",
        }
    }
}

impl LoyaltyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Ledger(LedgerError::InsufficientBalance { .. }) => ErrorKind::InsufficientBalance,
            Self::Invalid(_) | Self::Ledger(_) | Self::Rules(_) => ErrorKind::Validation,
            Self::Store(StoreError::VersionConflict { .. } | StoreError::OutOfOrder { .. } | StoreError::DuplicateOrder { .. })
            | Self::ConcurrentModification { .. } => ErrorKind::Conflict,
            Self::Store(StoreError::Unavailable(_) | StoreError::Database(_)) => ErrorKind::StoreUnavailable,
            Self::Store(StoreError::Corrupt(_)) => ErrorKind::Internal,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoyaltyError>;
