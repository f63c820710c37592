//! Daily sales aggregation (end-of-day rollup per branch).
//!
//! Reads every sale of one business day, attributes it to a branch through
//! the device -> branch map, and upserts one `branch_aggregates` row per
//! branch keyed by `(branch_id, date_id)`.
//!
//! Re-running a day overwrites its rows, so the job is idempotent. All
//! writes of a run commit in one transaction: a day is either fully
//! replaced or left untouched.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::business_time::{BusinessClock, DayWindow};
use crate::db::{self, DbState};
use crate::error::{AggregationError, LedgerError};
use crate::model::{self, BranchAssignment, CoinBreakdown, SaleEvent};
use crate::resolver::{self, DeviceBranchMap};

pub const SETTINGS_CATEGORY: &str = "aggregation";
pub const KEY_LAST_RUN_DATE: &str = "last_run_date_id";
pub const KEY_LAST_RUN_AT: &str = "last_run_at";

// ---------------------------------------------------------------------------
// Fold
// ---------------------------------------------------------------------------

/// Running totals for one branch bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchAccumulator {
    pub total_transactions: i64,
    pub grand_total: i64,
    pub coins: CoinBreakdown,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

impl BranchAccumulator {
    /// Overflow leaves the accumulator untouched and fails the fold.
    pub fn push(&mut self, event: &SaleEvent) -> Result<(), LedgerError> {
        let grand_total = self
            .grand_total
            .checked_add(event.total)
            .ok_or(LedgerError::Overflow("branch grand total"))?;
        let mut coins = self.coins;
        coins.add(&event.coins)?;

        self.total_transactions += 1;
        self.grand_total = grand_total;
        self.coins = coins;
        self.earliest = Some(match self.earliest {
            Some(t) => t.min(event.timestamp),
            None => event.timestamp,
        });
        self.latest = Some(match self.latest {
            Some(t) => t.max(event.timestamp),
            None => event.timestamp,
        });
        Ok(())
    }
}

/// Fold a day's events into per-branch accumulators. Events from devices
/// without a unit land in the `unknown` bucket, so the sum of bucket totals
/// always equals the sum of event totals. A total that does not fit in an
/// `i64` fails the whole fold.
pub fn fold_sales(
    events: &[SaleEvent],
    map: &DeviceBranchMap,
) -> Result<BTreeMap<BranchAssignment, BranchAccumulator>, LedgerError> {
    let mut buckets: BTreeMap<BranchAssignment, BranchAccumulator> = BTreeMap::new();
    let mut unmapped: BTreeMap<&str, usize> = BTreeMap::new();

    for event in events {
        let assignment = map.resolve(&event.device_id);
        if assignment == BranchAssignment::Unknown {
            *unmapped.entry(event.device_id.as_str()).or_default() += 1;
        }
        if !event.is_consistent() {
            warn!(
                sale_id = %event.id,
                device_id = %event.device_id,
                total = event.total,
                coin_value = ?event.coins.value().ok(),
                "Sale total disagrees with coin breakdown, aggregating as reported"
            );
        }
        buckets.entry(assignment).or_default().push(event)?;
    }

    for (device_id, count) in unmapped {
        warn!(
            device_id = %device_id,
            events = count,
            "Device has no unit record, attributing sales to 'unknown'"
        );
    }

    Ok(buckets)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationOutcome {
    pub date_id: String,
    /// Zero means nothing was written.
    pub events: usize,
    pub branches: usize,
    pub grand_total: i64,
}

/// Scheduled entry point: aggregate the business day containing `now`.
pub fn run_daily_aggregation(
    db: &DbState,
    clock: &BusinessClock,
    now: DateTime<Utc>,
) -> Result<AggregationOutcome, AggregationError> {
    let window = clock.day_window(now);
    aggregate_window(db, &window, now)
}

/// Re-run (or backfill) a named business day with the same semantics.
pub fn run_aggregation_for_date(
    db: &DbState,
    clock: &BusinessClock,
    date_id: &str,
    now: DateTime<Utc>,
) -> Result<AggregationOutcome, AggregationError> {
    let window = clock
        .window_for_date(date_id)
        .map_err(|_| AggregationError::InvalidDate(date_id.to_string()))?;
    aggregate_window(db, &window, now)
}

fn aggregate_window(
    db: &DbState,
    window: &DayWindow,
    now: DateTime<Utc>,
) -> Result<AggregationOutcome, AggregationError> {
    info!(
        date_id = %window.date_id,
        start = %window.start.to_rfc3339(),
        end = %window.end.to_rfc3339(),
        "Starting daily aggregation"
    );

    let result = db
        .lock()
        .and_then(|conn| db::in_immediate_transaction(&conn, |conn| aggregate_in_tx(conn, window, now)));

    match result {
        Ok(outcome) => {
            if outcome.events > 0 {
                info!(
                    date_id = %outcome.date_id,
                    events = outcome.events,
                    branches = outcome.branches,
                    grand_total = outcome.grand_total,
                    "Daily aggregation committed"
                );
            }
            Ok(outcome)
        }
        Err(source) => {
            error!(
                date_id = %window.date_id,
                error = %source,
                "Daily aggregation failed, no aggregates written"
            );
            Err(AggregationError::Store {
                date_id: window.date_id.clone(),
                source,
            })
        }
    }
}

fn aggregate_in_tx(
    conn: &Connection,
    window: &DayWindow,
    now: DateTime<Utc>,
) -> Result<AggregationOutcome, LedgerError> {
    let map = resolver::build_device_branch_map(conn)?;
    let events = load_sales_in_window(conn, window)?;

    if events.is_empty() {
        info!(date_id = %window.date_id, "No sales in window, nothing to aggregate");
        return Ok(AggregationOutcome {
            date_id: window.date_id.clone(),
            events: 0,
            branches: 0,
            grand_total: 0,
        });
    }

    if map.is_empty() {
        warn!(date_id = %window.date_id, "No units registered, every sale lands in 'unknown'");
    } else {
        debug!(date_id = %window.date_id, units = map.len(), "Device map loaded");
    }

    let buckets = fold_sales(&events, &map)?;
    let grand_total = buckets
        .values()
        .try_fold(0i64, |sum, acc| sum.checked_add(acc.grand_total))
        .ok_or(LedgerError::Overflow("day grand total"))?;
    let now_ms = now.timestamp_millis();

    for (assignment, acc) in &buckets {
        upsert_branch_aggregate(conn, assignment.bucket_id(), window, acc, now_ms)?;
    }

    // A branch that lost all its sales since the previous run (unit moved)
    // must not keep a stale row for the day.
    let written: BTreeSet<&str> = buckets.keys().map(BranchAssignment::bucket_id).collect();
    for stale in branches_with_aggregate(conn, &window.date_id)? {
        if !written.contains(stale.as_str()) {
            conn.execute(
                "DELETE FROM branch_aggregates WHERE branch_id = ?1 AND date_id = ?2",
                params![stale, window.date_id],
            )?;
            warn!(
                branch_id = %stale,
                date_id = %window.date_id,
                "Removed stale aggregate with no sales on re-run"
            );
        }
    }

    db::set_setting(conn, SETTINGS_CATEGORY, KEY_LAST_RUN_DATE, &window.date_id)?;
    db::set_setting(conn, SETTINGS_CATEGORY, KEY_LAST_RUN_AT, &now.to_rfc3339())?;

    Ok(AggregationOutcome {
        date_id: window.date_id.clone(),
        events: events.len(),
        branches: buckets.len(),
        grand_total,
    })
}

/// All sales with `start <= timestamp <= end`.
pub fn load_sales_in_window(
    conn: &Connection,
    window: &DayWindow,
) -> Result<Vec<SaleEvent>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT id, device_id, coins_1, coins_5, coins_10, coins_20, total, timestamp_ms
         FROM sales
         WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2
         ORDER BY timestamp_ms ASC, id ASC",
    )?;

    let rows = stmt
        .query_map(params![window.start_ms(), window.end_ms()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                CoinBreakdown::new(row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?),
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, device_id, coins, total, ts)| {
            Ok(SaleEvent {
                id,
                device_id,
                coins,
                total,
                timestamp: model::from_millis(ts)?,
            })
        })
        .collect()
}

/// Insert or overwrite the bucket's row for the day. A re-run that computes
/// the same content leaves the row untouched, `processed_at_ms` included;
/// `created_at_ms` is never overwritten.
fn upsert_branch_aggregate(
    conn: &Connection,
    branch_id: &str,
    window: &DayWindow,
    acc: &BranchAccumulator,
    now_ms: i64,
) -> Result<(), LedgerError> {
    let earliest = acc.earliest.unwrap_or(window.start).timestamp_millis();
    let latest = acc.latest.unwrap_or(window.start).timestamp_millis();

    conn.execute(
        "INSERT INTO branch_aggregates (
            branch_id, date_id, aggregate_date_ms, total_transactions, grand_total,
            coins_1, coins_5, coins_10, coins_20, total_coins,
            earliest_ms, latest_ms, created_at_ms, processed_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
         ON CONFLICT(branch_id, date_id) DO UPDATE SET
            aggregate_date_ms = excluded.aggregate_date_ms,
            total_transactions = excluded.total_transactions,
            grand_total = excluded.grand_total,
            coins_1 = excluded.coins_1,
            coins_5 = excluded.coins_5,
            coins_10 = excluded.coins_10,
            coins_20 = excluded.coins_20,
            total_coins = excluded.total_coins,
            earliest_ms = excluded.earliest_ms,
            latest_ms = excluded.latest_ms,
            processed_at_ms = excluded.processed_at_ms
         WHERE branch_aggregates.aggregate_date_ms IS NOT excluded.aggregate_date_ms
            OR branch_aggregates.total_transactions IS NOT excluded.total_transactions
            OR branch_aggregates.grand_total IS NOT excluded.grand_total
            OR branch_aggregates.coins_1 IS NOT excluded.coins_1
            OR branch_aggregates.coins_5 IS NOT excluded.coins_5
            OR branch_aggregates.coins_10 IS NOT excluded.coins_10
            OR branch_aggregates.coins_20 IS NOT excluded.coins_20
            OR branch_aggregates.total_coins IS NOT excluded.total_coins
            OR branch_aggregates.earliest_ms IS NOT excluded.earliest_ms
            OR branch_aggregates.latest_ms IS NOT excluded.latest_ms",
        params![
            branch_id,
            window.date_id,
            window.start_ms(),
            acc.total_transactions,
            acc.grand_total,
            acc.coins.coins_1,
            acc.coins.coins_5,
            acc.coins.coins_10,
            acc.coins.coins_20,
            acc.coins.total_coins()?,
            earliest,
            latest,
            now_ms,
        ],
    )?;
    Ok(())
}

fn branches_with_aggregate(conn: &Connection, date_id: &str) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn.prepare("SELECT branch_id FROM branch_aggregates WHERE date_id = ?1")?;
    let ids = stmt
        .query_map([date_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Last committed run, if any: `(date_id, run_at)`.
pub fn last_run(db: &DbState) -> Result<Option<(String, String)>, LedgerError> {
    let conn = db.lock()?;
    let date_id = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_RUN_DATE);
    let run_at = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_RUN_AT);
    Ok(date_id.zip(run_at))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest;
    use chrono::{Duration, TimeZone};

    fn clock() -> BusinessClock {
        BusinessClock::new(480).unwrap()
    }

    /// 2026-03-01 in Manila; the trigger fires at 23:59 local (15:59 UTC).
    fn trigger_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 15, 59, 0).unwrap()
    }

    fn seed_units(db: &DbState) {
        let conn = db.lock().unwrap();
        conn.execute_batch(
            "INSERT INTO branches (branch_id, name) VALUES ('branchA', 'Cubao');
             INSERT INTO branches (branch_id, name) VALUES ('branchB', 'Marikina');
             INSERT INTO units (device_id, branch_id) VALUES ('U1', 'branchA');
             INSERT INTO units (device_id, branch_id) VALUES ('U2', 'branchB');
             INSERT INTO units (device_id, branch_id) VALUES ('U3', NULL);",
        )
        .expect("seed units");
    }

    fn sale(device_id: &str, coins: CoinBreakdown, at: DateTime<Utc>) -> SaleEvent {
        SaleEvent {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            coins,
            total: coins.value().unwrap(),
            timestamp: at,
        }
    }

    fn insert(db: &DbState, event: &SaleEvent) {
        let conn = db.lock().unwrap();
        ingest::insert_sale(&conn, event).expect("insert sale");
    }

    fn aggregate_row(db: &DbState, branch_id: &str, date_id: &str) -> Option<serde_json::Value> {
        let conn = db.lock().unwrap();
        conn.query_row(
            "SELECT total_transactions, grand_total, coins_1, coins_5, coins_10, coins_20,
                    total_coins, earliest_ms, latest_ms, created_at_ms, aggregate_date_ms,
                    processed_at_ms
             FROM branch_aggregates WHERE branch_id = ?1 AND date_id = ?2",
            params![branch_id, date_id],
            |row| {
                Ok(serde_json::json!({
                    "totalTransactions": row.get::<_, i64>(0)?,
                    "grandTotal": row.get::<_, i64>(1)?,
                    "coins_1": row.get::<_, i64>(2)?,
                    "coins_5": row.get::<_, i64>(3)?,
                    "coins_10": row.get::<_, i64>(4)?,
                    "coins_20": row.get::<_, i64>(5)?,
                    "totalCoins": row.get::<_, i64>(6)?,
                    "earliest": row.get::<_, i64>(7)?,
                    "latest": row.get::<_, i64>(8)?,
                    "createdAt": row.get::<_, i64>(9)?,
                    "aggregateDate": row.get::<_, i64>(10)?,
                    "processedAt": row.get::<_, i64>(11)?,
                }))
            },
        )
        .ok()
    }

    fn aggregate_count(db: &DbState) -> i64 {
        let conn = db.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM branch_aggregates", [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_two_branch_scenario() {
        let db = db::test_state();
        seed_units(&db);
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();

        insert(&db, &sale("U1", CoinBreakdown::new(3, 0, 0, 0), noon));
        insert(
            &db,
            &sale("U1", CoinBreakdown::new(0, 1, 0, 0), noon + Duration::minutes(5)),
        );
        insert(
            &db,
            &sale("U2", CoinBreakdown::new(0, 0, 1, 0), noon + Duration::minutes(7)),
        );

        let outcome = run_daily_aggregation(&db, &clock(), trigger_time()).expect("run");
        assert_eq!(outcome.date_id, "2026-03-01");
        assert_eq!(outcome.events, 3);
        assert_eq!(outcome.branches, 2);
        assert_eq!(outcome.grand_total, 18);

        let a = aggregate_row(&db, "branchA", "2026-03-01").expect("branchA aggregate");
        assert_eq!(a["coins_1"], 3);
        assert_eq!(a["coins_5"], 1);
        assert_eq!(a["grandTotal"], 8);
        assert_eq!(a["totalTransactions"], 2);
        assert_eq!(a["totalCoins"], 4);
        assert_eq!(a["earliest"], noon.timestamp_millis());
        assert_eq!(a["latest"], (noon + Duration::minutes(5)).timestamp_millis());

        let b = aggregate_row(&db, "branchB", "2026-03-01").expect("branchB aggregate");
        assert_eq!(b["coins_10"], 1);
        assert_eq!(b["grandTotal"], 10);
        assert_eq!(b["totalTransactions"], 1);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let db = db::test_state();
        seed_units(&db);
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();
        insert(&db, &sale("U1", CoinBreakdown::new(2, 2, 2, 2), noon));
        insert(&db, &sale("U2", CoinBreakdown::new(0, 0, 0, 1), noon));

        run_daily_aggregation(&db, &clock(), trigger_time()).expect("first run");
        let first_a = aggregate_row(&db, "branchA", "2026-03-01");
        let first_b = aggregate_row(&db, "branchB", "2026-03-01");

        let later = trigger_time() + Duration::seconds(30);
        run_daily_aggregation(&db, &clock(), later).expect("second run");

        assert_eq!(aggregate_count(&db), 2);
        assert_eq!(aggregate_row(&db, "branchA", "2026-03-01"), first_a);
        assert_eq!(aggregate_row(&db, "branchB", "2026-03-01"), first_b);
    }

    #[test]
    fn test_rerun_with_new_sale_refreshes_processed_at_only_where_changed() {
        let db = db::test_state();
        seed_units(&db);
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();
        insert(&db, &sale("U1", CoinBreakdown::new(1, 0, 0, 0), noon));
        insert(&db, &sale("U2", CoinBreakdown::new(0, 1, 0, 0), noon));

        run_daily_aggregation(&db, &clock(), trigger_time()).expect("first run");
        let first_a = aggregate_row(&db, "branchA", "2026-03-01").unwrap();
        let first_b = aggregate_row(&db, "branchB", "2026-03-01").unwrap();

        insert(
            &db,
            &sale("U1", CoinBreakdown::new(0, 0, 1, 0), noon + Duration::hours(1)),
        );
        let later = trigger_time() + Duration::minutes(5);
        run_daily_aggregation(&db, &clock(), later).expect("second run");

        let second_a = aggregate_row(&db, "branchA", "2026-03-01").unwrap();
        assert_eq!(second_a["grandTotal"], 11);
        assert_eq!(second_a["createdAt"], first_a["createdAt"]);
        assert_eq!(second_a["processedAt"], later.timestamp_millis());
        assert_eq!(aggregate_row(&db, "branchB", "2026-03-01").unwrap(), first_b);
    }

    #[test]
    fn test_overflowing_totals_fail_the_run_without_poisoning() {
        let db = db::test_state();
        seed_units(&db);
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();
        for _ in 0..2 {
            let mut huge = sale("U1", CoinBreakdown::new(1, 0, 0, 0), noon);
            huge.total = i64::MAX;
            insert(&db, &huge);
        }

        let err = run_daily_aggregation(&db, &clock(), trigger_time()).unwrap_err();
        assert!(matches!(
            err,
            AggregationError::Store {
                source: LedgerError::Overflow(_),
                ..
            }
        ));

        // The store stays usable and nothing was committed.
        assert!(db.lock().is_ok());
        assert_eq!(aggregate_count(&db), 0);
        assert!(last_run(&db).unwrap().is_none());
    }

    #[test]
    fn test_conservation_with_unmapped_and_unassigned_devices() {
        let db = db::test_state();
        seed_units(&db);
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();
        let events = vec![
            sale("U1", CoinBreakdown::new(1, 2, 0, 0), noon),
            sale("U2", CoinBreakdown::new(0, 0, 3, 1), noon),
            sale("U3", CoinBreakdown::new(4, 0, 0, 0), noon),
            sale("ghost-device", CoinBreakdown::new(0, 0, 0, 2), noon),
        ];
        for e in &events {
            insert(&db, e);
        }

        run_daily_aggregation(&db, &clock(), trigger_time()).expect("run");

        let conn = db.lock().unwrap();
        let (sum_total, sum_c1, sum_c20): (i64, i64, i64) = conn
            .query_row(
                "SELECT SUM(grand_total), SUM(coins_1), SUM(coins_20)
                 FROM branch_aggregates WHERE date_id = '2026-03-01'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        drop(conn);

        assert_eq!(sum_total, events.iter().map(|e| e.total).sum::<i64>());
        assert_eq!(sum_c1, events.iter().map(|e| e.coins.coins_1).sum::<i64>());
        assert_eq!(sum_c20, events.iter().map(|e| e.coins.coins_20).sum::<i64>());

        assert_eq!(
            aggregate_row(&db, "unknown", "2026-03-01").unwrap()["grandTotal"],
            40
        );
        assert_eq!(
            aggregate_row(&db, "unassigned", "2026-03-01").unwrap()["grandTotal"],
            4
        );
    }

    #[test]
    fn test_window_boundaries() {
        let db = db::test_state();
        seed_units(&db);
        let window = clock().window_for_date("2026-03-01").unwrap();

        insert(&db, &sale("U1", CoinBreakdown::new(1, 0, 0, 0), window.end));
        insert(&db, &sale("U1", CoinBreakdown::new(1, 0, 0, 0), window.start));
        insert(
            &db,
            &sale(
                "U1",
                CoinBreakdown::new(0, 0, 0, 5),
                window.start - Duration::milliseconds(1),
            ),
        );

        run_daily_aggregation(&db, &clock(), trigger_time()).expect("run");

        let a = aggregate_row(&db, "branchA", "2026-03-01").unwrap();
        assert_eq!(a["totalTransactions"], 2);
        assert_eq!(a["grandTotal"], 2);
        assert_eq!(a["latest"], window.end_ms());
        assert_eq!(a["earliest"], window.start_ms());
    }

    #[test]
    fn test_empty_day_is_noop() {
        let db = db::test_state();
        seed_units(&db);

        let outcome = run_daily_aggregation(&db, &clock(), trigger_time()).expect("run");
        assert_eq!(outcome.events, 0);
        assert_eq!(aggregate_count(&db), 0);
        assert!(last_run(&db).unwrap().is_none());
    }

    #[test]
    fn test_rerun_after_reassignment_drops_stale_branch() {
        let db = db::test_state();
        seed_units(&db);
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();
        insert(&db, &sale("U2", CoinBreakdown::new(0, 0, 1, 0), noon));

        run_aggregation_for_date(&db, &clock(), "2026-03-01", trigger_time()).expect("run");
        assert!(aggregate_row(&db, "branchB", "2026-03-01").is_some());

        db.lock()
            .unwrap()
            .execute("UPDATE units SET branch_id = 'branchA' WHERE device_id = 'U2'", [])
            .unwrap();
        run_aggregation_for_date(&db, &clock(), "2026-03-01", trigger_time()).expect("rerun");

        assert!(aggregate_row(&db, "branchB", "2026-03-01").is_none());
        assert_eq!(
            aggregate_row(&db, "branchA", "2026-03-01").unwrap()["grandTotal"],
            10
        );
    }

    #[test]
    fn test_failed_write_leaves_day_untouched() {
        let db = db::test_state();
        seed_units(&db);
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();
        insert(&db, &sale("U1", CoinBreakdown::new(1, 0, 0, 0), noon));
        insert(&db, &sale("U2", CoinBreakdown::new(0, 0, 1, 0), noon));

        // Make the second branch write fail after the first succeeded.
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_branch_b BEFORE INSERT ON branch_aggregates
                 WHEN NEW.branch_id = 'branchB'
                 BEGIN SELECT RAISE(ABORT, 'disk on fire'); END;",
            )
            .unwrap();

        let err = run_daily_aggregation(&db, &clock(), trigger_time()).unwrap_err();
        match err {
            AggregationError::Store { date_id, .. } => assert_eq!(date_id, "2026-03-01"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(aggregate_count(&db), 0, "no partial day may be committed");
        assert!(last_run(&db).unwrap().is_none());
    }

    #[test]
    fn test_run_marker_recorded() {
        let db = db::test_state();
        seed_units(&db);
        insert(
            &db,
            &sale(
                "U1",
                CoinBreakdown::new(1, 0, 0, 0),
                Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap(),
            ),
        );

        run_daily_aggregation(&db, &clock(), trigger_time()).expect("run");
        let (date_id, run_at) = last_run(&db).unwrap().expect("marker");
        assert_eq!(date_id, "2026-03-01");
        assert_eq!(run_at, trigger_time().to_rfc3339());
    }

    #[test]
    fn test_invalid_replay_date() {
        let db = db::test_state();
        let err = run_aggregation_for_date(&db, &clock(), "March 1", trigger_time()).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidDate(_)));
    }

    #[test]
    fn test_fold_keeps_inconsistent_totals() {
        let map = DeviceBranchMap::from_units(&[crate::model::Unit {
            device_id: "U1".into(),
            branch_id: Some("branchA".into()),
        }]);
        let mut odd = sale(
            "U1",
            CoinBreakdown::new(0, 1, 0, 0),
            Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap(),
        );
        odd.total = 6;

        let buckets = fold_sales(&[odd], &map).unwrap();
        let acc = &buckets[&BranchAssignment::Resolved("branchA".into())];
        assert_eq!(acc.grand_total, 6);
        assert_eq!(acc.coins.coins_5, 1);
    }
}
