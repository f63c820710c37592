//! Read-only projection of a branch's daily aggregates for the dashboard.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::business_time::{self, BusinessClock};
use crate::db::DbState;
use crate::error::{HistoryError, LedgerError};
use crate::model::{self, BranchDailyAggregate, CoinBreakdown};

pub const DEFAULT_HISTORY_LIMIT: usize = 30;
pub const MAX_HISTORY_LIMIT: usize = 366;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalAggregate {
    pub date_id: String,
    /// e.g. `March 1, 2026`
    pub display_date: String,
    pub grand_total: i64,
    pub total_transactions: i64,
    #[serde(flatten)]
    pub coins: CoinBreakdown,
    pub total_coins: i64,
    pub earliest: String,
    pub latest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchHistory {
    pub branch_id: String,
    pub branch_name: String,
    pub records: Vec<HistoricalAggregate>,
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

/// Most recent `limit` aggregates of a branch, newest first.
///
/// An unknown branch is an error; a known branch without aggregates yields an
/// empty `records` list.
pub fn read_history(
    db: &DbState,
    clock: &BusinessClock,
    branch_id: &str,
    limit: Option<usize>,
) -> Result<BranchHistory, HistoryError> {
    let conn = db.lock()?;

    let branch_name = branch_display_name(&conn, branch_id)?
        .ok_or_else(|| HistoryError::BranchNotFound(branch_id.to_string()))?;

    let records = load_branch_aggregates(&conn, branch_id, clamp_limit(limit))?
        .iter()
        .map(|agg| to_historical(clock, agg))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BranchHistory {
        branch_id: branch_id.to_string(),
        branch_name,
        records,
    })
}

/// `name`, then `location`, then the id itself. `None` when the branch
/// does not exist.
fn branch_display_name(conn: &Connection, branch_id: &str) -> Result<Option<String>, LedgerError> {
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT name, location FROM branches WHERE branch_id = ?1",
            [branch_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(row.map(|(name, location)| {
        name.filter(|s| !s.trim().is_empty())
            .or(location.filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| branch_id.to_string())
    }))
}

pub fn load_branch_aggregates(
    conn: &Connection,
    branch_id: &str,
    limit: usize,
) -> Result<Vec<BranchDailyAggregate>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT branch_id, date_id, aggregate_date_ms, total_transactions, grand_total,
                coins_1, coins_5, coins_10, coins_20, total_coins,
                earliest_ms, latest_ms, created_at_ms, processed_at_ms
         FROM branch_aggregates
         WHERE branch_id = ?1
         ORDER BY date_id DESC
         LIMIT ?2",
    )?;

    let rows = stmt
        .query_map(params![branch_id, limit as i64], |row| {
            Ok(AggregateRow {
                branch_id: row.get(0)?,
                date_id: row.get(1)?,
                aggregate_date_ms: row.get(2)?,
                total_transactions: row.get(3)?,
                grand_total: row.get(4)?,
                coins: CoinBreakdown::new(row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?),
                total_coins: row.get(9)?,
                earliest_ms: row.get(10)?,
                latest_ms: row.get(11)?,
                created_at_ms: row.get(12)?,
                processed_at_ms: row.get(13)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(AggregateRow::into_aggregate).collect()
}

struct AggregateRow {
    branch_id: String,
    date_id: String,
    aggregate_date_ms: i64,
    total_transactions: i64,
    grand_total: i64,
    coins: CoinBreakdown,
    total_coins: i64,
    earliest_ms: i64,
    latest_ms: i64,
    created_at_ms: i64,
    processed_at_ms: i64,
}

impl AggregateRow {
    fn into_aggregate(self) -> Result<BranchDailyAggregate, LedgerError> {
        Ok(BranchDailyAggregate {
            branch_id: self.branch_id,
            date_id: self.date_id,
            aggregate_date: model::from_millis(self.aggregate_date_ms)?,
            total_transactions: self.total_transactions,
            grand_total: self.grand_total,
            coins: self.coins,
            total_coins: self.total_coins,
            earliest: model::from_millis(self.earliest_ms)?,
            latest: model::from_millis(self.latest_ms)?,
            created_at: model::from_millis(self.created_at_ms)?,
            processed_at: model::from_millis(self.processed_at_ms)?,
        })
    }
}

fn to_historical(
    clock: &BusinessClock,
    agg: &BranchDailyAggregate,
) -> Result<HistoricalAggregate, LedgerError> {
    let date = business_time::parse_date_id(&agg.date_id)?;
    Ok(HistoricalAggregate {
        date_id: agg.date_id.clone(),
        display_date: date.format("%B %-d, %Y").to_string(),
        grand_total: agg.grand_total,
        total_transactions: agg.total_transactions,
        coins: agg.coins,
        // Coin count, same definition as the aggregation job.
        total_coins: agg.coins.total_coins()?,
        earliest: clock.to_business(agg.earliest).to_rfc3339(),
        latest: clock.to_business(agg.latest).to_rfc3339(),
    })
}
