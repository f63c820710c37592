//! Raw sale ingestion (`sales/{autoId}`).
//!
//! This is the one place device timestamps are interpreted. Everything
//! downstream reads `timestamp_ms` as stored here.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::LedgerError;
use crate::model::{CoinBreakdown, PointInTime, SaleEvent};

/// Upper bound on any one denomination in a single insertion session.
pub const MAX_COINS_PER_DENOMINATION: i64 = 100_000;

/// Upper bound on a single sale, in pesos.
pub const MAX_SALE_TOTAL: i64 = 2_000_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePayload {
    #[serde(default, alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub coins: CoinBreakdown,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<PointInTime>,
}

/// Validate and normalize a payload into a storable event. A missing
/// timestamp means "received now".
pub fn normalize_sale(payload: &SalePayload, now: DateTime<Utc>) -> Result<SaleEvent, LedgerError> {
    let device_id = payload
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LedgerError::Validation("deviceId is required".into()))?;

    if payload.coins.has_negative() {
        return Err(LedgerError::Validation(format!(
            "negative coin count from device {device_id}"
        )));
    }

    let timestamp = match &payload.timestamp {
        Some(p) => p.to_utc()?,
        None => now,
    };

    let coins = &payload.coins;
    if [coins.coins_1, coins.coins_5, coins.coins_10, coins.coins_20]
        .iter()
        .any(|&count| count > MAX_COINS_PER_DENOMINATION)
    {
        return Err(LedgerError::Validation(format!(
            "coin count above {MAX_COINS_PER_DENOMINATION} from device {device_id}"
        )));
    }

    let derived = coins.value()?;
    let total = payload.total.unwrap_or(derived);
    if !(0..=MAX_SALE_TOTAL).contains(&total) {
        return Err(LedgerError::Validation(format!(
            "total {total} from device {device_id} is outside 0..={MAX_SALE_TOTAL}"
        )));
    }
    if total != derived {
        // Raw events are facts; keep what the device reported.
        warn!(
            device_id = %device_id,
            reported_total = total,
            coin_value = derived,
            "Sale total disagrees with coin breakdown"
        );
    }

    Ok(SaleEvent {
        id: Uuid::new_v4().to_string(),
        device_id: device_id.to_string(),
        coins: payload.coins,
        total,
        timestamp,
    })
}

/// Append a sale event. Returns the new document id.
pub fn record_sale(
    db: &DbState,
    payload: &SalePayload,
    now: DateTime<Utc>,
) -> Result<String, LedgerError> {
    let event = normalize_sale(payload, now)?;
    let conn = db.lock()?;
    insert_sale(&conn, &event)?;

    info!(
        sale_id = %event.id,
        device_id = %event.device_id,
        total = event.total,
        "Recorded sale"
    );
    Ok(event.id)
}

pub fn insert_sale(conn: &rusqlite::Connection, event: &SaleEvent) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO sales (id, device_id, coins_1, coins_5, coins_10, coins_20, total, timestamp_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id,
            event.device_id,
            event.coins.coins_1,
            event.coins.coins_5,
            event.coins.coins_10,
            event.coins.coins_20,
            event.total,
            event.timestamp.timestamp_millis(),
        ],
    )?;
    Ok(())
}
