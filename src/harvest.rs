//! Harvest settlement: collect a device's unharvested daily aggregates.
//!
//! The selection and the `harvested = 1` update run in one IMMEDIATE
//! transaction, and the update is conditioned on `harvested = 0` for exactly
//! the selected keys. A racing settlement for the same device either waits
//! and then sees nothing, or fails the row-count check and rolls back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Deserialize;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{HarvestError, LedgerError};
use crate::model::{self, BranchAssignment, CoinBreakdown, HarvestResult, UnitDailyAggregate};
use crate::resolver;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestRequest {
    #[serde(default, alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// Constant-time over the expected length; an empty secret never matches.
pub fn keys_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    if b.is_empty() || a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Validate the request, then settle every unharvested aggregate of the device.
///
/// Credential and input checks happen before the store is touched.
pub fn settle_harvest(
    db: &DbState,
    request: &HarvestRequest,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<HarvestResult, HarvestError> {
    if !keys_match(request.key.as_deref().unwrap_or_default(), secret) {
        warn!("Harvest rejected: invalid key");
        return Err(HarvestError::InvalidCredential);
    }

    let device_id = request
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(HarvestError::MissingDeviceId)?;

    let conn = db.lock()?;
    let result = db::in_immediate_transaction(&conn, |conn| settle_in_tx(conn, device_id, now))?;

    info!(
        device_id = %device_id,
        documents = result.documents_updated,
        total = result.total_harvested,
        "Harvest settled"
    );
    Ok(result)
}

fn settle_in_tx(
    conn: &Connection,
    device_id: &str,
    now: DateTime<Utc>,
) -> Result<HarvestResult, HarvestError> {
    let pending = load_unharvested(conn, device_id)?;
    if pending.is_empty() {
        info!(device_id = %device_id, "Nothing to harvest");
        return Err(HarvestError::NothingToHarvest {
            device_id: device_id.to_string(),
        });
    }

    let mut result = HarvestResult {
        device_id: device_id.to_string(),
        total_harvested: 0,
        coins: CoinBreakdown::default(),
        sales_count: 0,
        documents_updated: 0,
        harvest_date: now,
    };
    for agg in &pending {
        result.total_harvested = result
            .total_harvested
            .checked_add(agg.total)
            .ok_or(LedgerError::Overflow("harvest total"))?;
        result.sales_count = result
            .sales_count
            .checked_add(agg.sales_count)
            .ok_or(LedgerError::Overflow("harvest sales count"))?;
        result.coins.add(&agg.coins)?;
    }

    let now_ms = now.timestamp_millis();
    let mut updated = 0usize;
    {
        let mut stmt = conn.prepare(
            "UPDATE unit_aggregates SET harvested = 1, harvested_at = ?1
             WHERE device_id = ?2 AND date_id = ?3 AND harvested = 0",
        )?;
        for agg in &pending {
            updated += stmt.execute(params![now_ms, device_id, agg.date_id])?;
        }
    }

    if updated != pending.len() {
        warn!(
            device_id = %device_id,
            selected = pending.len(),
            updated,
            "Harvest write set differs from read set, rolling back"
        );
        return Err(HarvestError::Conflict {
            device_id: device_id.to_string(),
            selected: pending.len(),
            updated,
        });
    }
    result.documents_updated = updated;

    roll_into_branch_total(conn, device_id, &result, now_ms)?;

    Ok(result)
}

pub fn load_unharvested(
    conn: &Connection,
    device_id: &str,
) -> Result<Vec<UnitDailyAggregate>, HarvestError> {
    let mut stmt = conn.prepare(
        "SELECT date_id, total, coins_1, coins_5, coins_10, coins_20, sales_count, harvested_at
         FROM unit_aggregates
         WHERE device_id = ?1 AND harvested = 0
         ORDER BY date_id ASC",
    )?;

    let rows = stmt
        .query_map([device_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                CoinBreakdown::new(row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?),
                row.get::<_, i64>(6)?,
                row.get::<_, Option<i64>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut pending = Vec::with_capacity(rows.len());
    for (date_id, total, coins, sales_count, harvested_at) in rows {
        pending.push(UnitDailyAggregate {
            device_id: device_id.to_string(),
            date_id,
            total,
            coins,
            sales_count,
            harvested: false,
            harvested_at: harvested_at.map(model::from_millis).transpose()?,
        });
    }
    Ok(pending)
}

/// Add the harvest to the owning branch's running total.
fn roll_into_branch_total(
    conn: &Connection,
    device_id: &str,
    result: &HarvestResult,
    now_ms: i64,
) -> Result<(), HarvestError> {
    let branch_id = match resolver::resolve_device(conn, device_id)? {
        BranchAssignment::Resolved(branch_id) => branch_id,
        other => {
            warn!(
                device_id = %device_id,
                bucket = %other.bucket_id(),
                "Harvested device has no branch, running total not updated"
            );
            return Ok(());
        }
    };

    let changed = conn.execute(
        "UPDATE branches SET
            harvested_total = harvested_total + ?1,
            harvested_coins = harvested_coins + ?2,
            last_harvest_at = ?3,
            updated_at = datetime('now')
         WHERE branch_id = ?4",
        params![
            result.total_harvested,
            result.coins.total_coins()?,
            now_ms,
            branch_id
        ],
    )?;

    if changed == 0 {
        warn!(
            device_id = %device_id,
            branch_id = %branch_id,
            "Unit points at a missing branch, running total not updated"
        );
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
