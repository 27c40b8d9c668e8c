//! Aggregates module
pub mod points_account;
pub mod transaction;

pub use points_account::{LedgerError, PointsAccount, PointsChange, PointsSnapshot};
pub use transaction::{PointsTransaction, TransactionType};
