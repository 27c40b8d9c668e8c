//! Value Objects for the loyalty ledger

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const MAX_ID_LEN: usize = 128;
const MAX_REASON_LEN: usize = 500;
const MAX_ORDER_ID_LEN: usize = 64;

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
}

fn normalize(field: &'static str, value: String, max: usize) -> Result<String, ValueError> {
    let trimmed = value.trim();
    if trimmed.is_empty() { return Err(ValueError::Empty(field)); }
    if trimmed.chars().count() > max { return Err(ValueError::TooLong { field, max }); }
    Ok(trimmed.to_string())
}

/// Storefront customer identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Result<Self, ValueError> {
        normalize("user id", value.into(), MAX_ID_LEN).map(Self)
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

/// Back-office administrator identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdminId(String);

impl AdminId {
    pub fn new(value: impl Into<String>) -> Result<Self, ValueError> {
        normalize("admin id", value.into(), MAX_ID_LEN).map(Self)
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

/// Required free-text justification attached to every ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reason(String);

impl Reason {
    pub fn new(value: impl Into<String>) -> Result<Self, ValueError> {
        normalize("reason", value.into(), MAX_REASON_LEN).map(Self)
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

/// Storefront order reference; at most one purchase award per user and order
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderId(String);

impl OrderId {
    pub fn new(value: impl Into<String>) -> Result<Self, ValueError> {
        normalize("order id", value.into(), MAX_ORDER_ID_LEN).map(Self)
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

macro_rules! string_value {
    ($($ty:ident),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
        }
        impl TryFrom<String> for $ty {
            type Error = ValueError;
            fn try_from(value: String) -> Result<Self, Self::Error> { Self::new(value) }
        }
        impl From<$ty> for String {
            fn from(value: $ty) -> Self { value.0 }
        }
    )*};
}

string_value!(UserId, AdminId, Reason, OrderId);

/// Cursor over a user's ledger, newest first.
///
/// `before` is an exclusive upper bound on the transaction sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub before: Option<i64>,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(before: Option<i64>, limit: Option<u32>) -> Self {
        Self { before, limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT) }
    }
    pub fn first(limit: u32) -> Self { Self::new(None, Some(limit)) }
}

impl Default for PageRequest {
    fn default() -> Self { Self::new(None, None) }
}
