//! Document shapes shared by ingestion, aggregation, settlement and history.
//!
//! Money is whole pesos (`i64`); every accepted coin is a 1, 5, 10 or 20 peso
//! piece so no fractional amounts exist anywhere in the ledger.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

// ---------------------------------------------------------------------------
// Coins
// ---------------------------------------------------------------------------

/// Per-denomination coin counts. Field names stay `coins_N` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinBreakdown {
    #[serde(default)]
    pub coins_1: i64,
    #[serde(default)]
    pub coins_5: i64,
    #[serde(default)]
    pub coins_10: i64,
    #[serde(default)]
    pub coins_20: i64,
}

impl CoinBreakdown {
    pub fn new(coins_1: i64, coins_5: i64, coins_10: i64, coins_20: i64) -> Self {
        Self {
            coins_1,
            coins_5,
            coins_10,
            coins_20,
        }
    }

    /// Number of physical coins, not their value.
    pub fn total_coins(&self) -> Result<i64, LedgerError> {
        [self.coins_5, self.coins_10, self.coins_20]
            .into_iter()
            .try_fold(self.coins_1, i64::checked_add)
            .ok_or(LedgerError::Overflow("coin count"))
    }

    /// Peso value of the coins.
    pub fn value(&self) -> Result<i64, LedgerError> {
        [(self.coins_5, 5), (self.coins_10, 10), (self.coins_20, 20)]
            .into_iter()
            .try_fold(self.coins_1, |acc, (count, peso)| {
                count.checked_mul(peso).and_then(|v| acc.checked_add(v))
            })
            .ok_or(LedgerError::Overflow("coin value"))
    }

    /// Fails without modifying `self` when any denomination would overflow.
    pub fn add(&mut self, other: &CoinBreakdown) -> Result<(), LedgerError> {
        let sum = |a: i64, b: i64| a.checked_add(b).ok_or(LedgerError::Overflow("coin count"));
        *self = CoinBreakdown {
            coins_1: sum(self.coins_1, other.coins_1)?,
            coins_5: sum(self.coins_5, other.coins_5)?,
            coins_10: sum(self.coins_10, other.coins_10)?,
            coins_20: sum(self.coins_20, other.coins_20)?,
        };
        Ok(())
    }

    pub fn has_negative(&self) -> bool {
        self.coins_1 < 0 || self.coins_5 < 0 || self.coins_10 < 0 || self.coins_20 < 0
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// A timestamp as devices and older dashboards send it: epoch millis, an
/// RFC 3339 string, or a `{seconds, nanoseconds}` object. Normalized to UTC
/// once at ingestion via [`PointInTime::to_utc`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointInTime {
    Millis(i64),
    Rfc3339(String),
    Timestamp {
        #[serde(alias = "_seconds")]
        seconds: i64,
        #[serde(default, alias = "_nanoseconds")]
        nanoseconds: u32,
    },
}

impl PointInTime {
    pub fn to_utc(&self) -> Result<DateTime<Utc>, LedgerError> {
        match self {
            PointInTime::Millis(ms) => from_millis(*ms),
            PointInTime::Rfc3339(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| LedgerError::Validation(format!("timestamp '{s}': {e}"))),
            PointInTime::Timestamp {
                seconds,
                nanoseconds,
            } => Utc
                .timestamp_opt(*seconds, *nanoseconds)
                .single()
                .ok_or_else(|| {
                    LedgerError::Validation(format!(
                        "timestamp out of range: {seconds}s {nanoseconds}ns"
                    ))
                }),
        }
    }
}

/// Convert stored epoch milliseconds back into a UTC instant.
pub fn from_millis(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| LedgerError::Validation(format!("timestamp out of range: {ms}ms")))
}

// ---------------------------------------------------------------------------
// Raw events and units
// ---------------------------------------------------------------------------

/// One coin insertion session reported by a device. Append-only.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleEvent {
    pub id: String,
    pub device_id: String,
    pub coins: CoinBreakdown,
    pub total: i64,
    pub timestamp: DateTime<Utc>,
}

impl SaleEvent {
    /// `total` agrees with the coin breakdown.
    pub fn is_consistent(&self) -> bool {
        self.coins.value().is_ok_and(|v| v == self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub device_id: String,
    pub branch_id: Option<String>,
}

/// Where a device's sales are attributed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BranchAssignment {
    Resolved(String),
    /// The unit exists but has no branch.
    Unassigned,
    /// No unit record for the device.
    Unknown,
}

impl BranchAssignment {
    pub const UNASSIGNED_ID: &'static str = "unassigned";
    pub const UNKNOWN_ID: &'static str = "unknown";

    /// Document id the aggregate for this assignment is written under.
    pub fn bucket_id(&self) -> &str {
        match self {
            BranchAssignment::Resolved(id) => id,
            BranchAssignment::Unassigned => Self::UNASSIGNED_ID,
            BranchAssignment::Unknown => Self::UNKNOWN_ID,
        }
    }

    pub fn branch_id(&self) -> Option<&str> {
        match self {
            BranchAssignment::Resolved(id) => Some(id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// `Branches/{branchId}/Aggregates/{dateId}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDailyAggregate {
    pub branch_id: String,
    pub date_id: String,
    /// Business midnight of `date_id`.
    pub aggregate_date: DateTime<Utc>,
    pub total_transactions: i64,
    pub grand_total: i64,
    #[serde(flatten)]
    pub coins: CoinBreakdown,
    pub total_coins: i64,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// `Units/{deviceId}/aggregates/{dateId}`, written upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitDailyAggregate {
    pub device_id: String,
    pub date_id: String,
    pub total: i64,
    #[serde(flatten)]
    pub coins: CoinBreakdown,
    #[serde(rename = "sales_count")]
    pub sales_count: i64,
    pub harvested: bool,
    pub harvested_at: Option<DateTime<Utc>>,
}

/// Sum over the unit aggregates flipped by one settlement. Not stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestResult {
    pub device_id: String,
    pub total_harvested: i64,
    #[serde(flatten)]
    pub coins: CoinBreakdown,
    #[serde(rename = "sales_count")]
    pub sales_count: i64,
    pub documents_updated: usize,
    pub harvest_date: DateTime<Utc>,
}
