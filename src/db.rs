//! Local SQLite document store for the ledger.
//!
//! Each collection of the dashboard's document layout maps to one table:
//! `Units` -> `units`, `Units/*/aggregates` -> `unit_aggregates`,
//! `Branches` -> `branches`, `Branches/*/Aggregates` -> `branch_aggregates`,
//! `sales` -> `sales`. Timestamps are epoch milliseconds (UTC).
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the [`DbState`] handle passed to every operation.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::LedgerError;

/// Data-access handle. Constructed once per worker and passed by reference.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "ledger.db";

/// Initialize the database at `{data_dir}/ledger.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. The file is the system of record: an
/// open failure is returned as is and never touches existing data.
pub fn init(data_dir: &Path) -> Result<DbState, LedgerError> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!("Database open failed at {}: {e}", db_path.display());
        e
    })?;

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas. `busy_timeout` goes first so
/// the WAL switch waits out a concurrent writer instead of failing.
fn open_and_configure(path: &Path) -> Result<Connection, LedgerError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migration_failed(version: i32) -> impl FnOnce(rusqlite::Error) -> LedgerError {
    move |source| {
        error!("Migration v{version} failed: {source}");
        LedgerError::Migration { version, source }
    }
}

/// Migration v1: collections of the document layout.
fn migrate_v1(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- Branches/{branchId}
        CREATE TABLE IF NOT EXISTS branches (
            branch_id TEXT PRIMARY KEY,
            name TEXT,
            location TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Units/{deviceId}; branch_id NULL means unassigned
        CREATE TABLE IF NOT EXISTS units (
            device_id TEXT PRIMARY KEY,
            branch_id TEXT,
            label TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- sales/{autoId}: raw, append-only
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            coins_1 INTEGER NOT NULL DEFAULT 0 CHECK (coins_1 >= 0),
            coins_5 INTEGER NOT NULL DEFAULT 0 CHECK (coins_5 >= 0),
            coins_10 INTEGER NOT NULL DEFAULT 0 CHECK (coins_10 >= 0),
            coins_20 INTEGER NOT NULL DEFAULT 0 CHECK (coins_20 >= 0),
            total INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            received_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sales_timestamp ON sales(timestamp_ms);

        -- Units/{deviceId}/aggregates/{dateId}
        CREATE TABLE IF NOT EXISTS unit_aggregates (
            device_id TEXT NOT NULL,
            date_id TEXT NOT NULL,
            total INTEGER NOT NULL DEFAULT 0,
            coins_1 INTEGER NOT NULL DEFAULT 0 CHECK (coins_1 >= 0),
            coins_5 INTEGER NOT NULL DEFAULT 0 CHECK (coins_5 >= 0),
            coins_10 INTEGER NOT NULL DEFAULT 0 CHECK (coins_10 >= 0),
            coins_20 INTEGER NOT NULL DEFAULT 0 CHECK (coins_20 >= 0),
            sales_count INTEGER NOT NULL DEFAULT 0,
            harvested INTEGER NOT NULL DEFAULT 0 CHECK (harvested IN (0, 1)),
            harvested_at INTEGER,
            PRIMARY KEY (device_id, date_id)
        );

        CREATE INDEX IF NOT EXISTS idx_unit_aggregates_unharvested
            ON unit_aggregates(device_id, harvested);

        -- Branches/{branchId}/Aggregates/{dateId}
        -- No FK to branches: sentinel buckets (unknown/unassigned) have no branch row.
        CREATE TABLE IF NOT EXISTS branch_aggregates (
            branch_id TEXT NOT NULL,
            date_id TEXT NOT NULL,
            aggregate_date_ms INTEGER NOT NULL,
            total_transactions INTEGER NOT NULL,
            grand_total INTEGER NOT NULL,
            coins_1 INTEGER NOT NULL DEFAULT 0,
            coins_5 INTEGER NOT NULL DEFAULT 0,
            coins_10 INTEGER NOT NULL DEFAULT 0,
            coins_20 INTEGER NOT NULL DEFAULT 0,
            total_coins INTEGER NOT NULL DEFAULT 0,
            earliest_ms INTEGER NOT NULL,
            latest_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL,
            processed_at_ms INTEGER NOT NULL,
            PRIMARY KEY (branch_id, date_id),
            CHECK (earliest_ms <= latest_ms)
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(migration_failed(1))?;

    info!("Applied migration v1 (document collections)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, LedgerError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: branch harvest running totals and the one-way harvested flag.
///
/// Adds:
/// - `harvested_total`, `harvested_coins`, `last_harvest_at` on `branches`
/// - a trigger rejecting any `harvested` 1 -> 0 transition
fn migrate_v2(conn: &Connection) -> Result<(), LedgerError> {
    for (column, ddl) in [
        (
            "harvested_total",
            "ALTER TABLE branches ADD COLUMN harvested_total INTEGER NOT NULL DEFAULT 0;",
        ),
        (
            "harvested_coins",
            "ALTER TABLE branches ADD COLUMN harvested_coins INTEGER NOT NULL DEFAULT 0;",
        ),
        (
            "last_harvest_at",
            "ALTER TABLE branches ADD COLUMN last_harvest_at INTEGER;",
        ),
    ] {
        if !column_exists(conn, "branches", column)? {
            conn.execute_batch(ddl).map_err(migration_failed(2))?;
        }
    }

    conn.execute_batch(
        "
        CREATE TRIGGER IF NOT EXISTS trg_unit_aggregates_harvest_one_way
        BEFORE UPDATE OF harvested ON unit_aggregates
        WHEN OLD.harvested = 1 AND NEW.harvested = 0
        BEGIN
            SELECT RAISE(ABORT, 'harvested flag cannot be reverted');
        END;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(migration_failed(2))?;

    info!("Applied migration v2 (branch harvest totals + one-way harvest flag)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`, rolling back on any error.
///
/// IMMEDIATE takes the write lock up front, so reads made inside `f` cannot
/// be invalidated by another connection before the writes commit.
pub fn in_immediate_transaction<T, E>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<LedgerError>,
{
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| E::from(LedgerError::from(e)))?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(E::from(LedgerError::from(e)));
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory, fully migrated store for unit tests across modules.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("set pragmas");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for table in [
            "local_settings",
            "branches",
            "units",
            "sales",
            "unit_aggregates",
            "branch_aggregates",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        assert!(column_exists(&conn, "branches", "harvested_total").unwrap());
        assert!(column_exists(&conn, "branches", "last_harvest_at").unwrap());
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        // WAL only works on file-backed databases; in-memory always returns "memory".
        let dir = std::env::temp_dir().join("pisonet_ledger_test_wal");
        let _ = std::fs::remove_dir_all(&dir);

        let state = init(&dir).expect("init temp db");
        let mode: String = state
            .lock()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
        assert!(state.db_path.ends_with(DB_FILE_NAME));

        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_open_failure_keeps_existing_ledger() {
        let dir = std::env::temp_dir().join(format!(
            "pisonet_ledger_test_locked_{}",
            uuid::Uuid::new_v4()
        ));
        {
            let state = init(&dir).expect("init temp db");
            state
                .lock()
                .unwrap()
                .execute(
                    "INSERT INTO sales (id, device_id, coins_1, total, timestamp_ms)
                     VALUES ('s1', 'U1', 1, 1, 0)",
                    [],
                )
                .expect("insert sale");
        }

        // Another process holds the file exclusively for longer than busy_timeout.
        let locker = Connection::open(dir.join(DB_FILE_NAME)).expect("open locker");
        locker
            .execute_batch("PRAGMA locking_mode = EXCLUSIVE; BEGIN EXCLUSIVE;")
            .expect("take exclusive lock");

        assert!(init(&dir).is_err(), "locked database must not open");

        locker.execute_batch("COMMIT;").expect("release lock");
        drop(locker);

        let state = init(&dir).expect("reopen after contention");
        let count: i64 = state
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))
            .expect("count sales");
        assert_eq!(count, 1, "sales must survive a failed open");

        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        // Running again should be a no-op (already at latest version)
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_sales_reject_negative_coins() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let res = conn.execute(
            "INSERT INTO sales (id, device_id, coins_1, total, timestamp_ms)
             VALUES ('s-1', 'D1', -2, -2, 0)",
            [],
        );
        assert!(res.is_err(), "negative coin count must violate CHECK");
    }

    #[test]
    fn test_harvested_flag_cannot_revert() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO unit_aggregates (device_id, date_id, total, harvested)
             VALUES ('D1', '2026-03-01', 50, 1)",
            [],
        )
        .expect("insert harvested aggregate");

        let res = conn.execute(
            "UPDATE unit_aggregates SET harvested = 0 WHERE device_id = 'D1'",
            [],
        );
        assert!(res.is_err(), "1 -> 0 must be rejected by trigger");

        let harvested: i64 = conn
            .query_row(
                "SELECT harvested FROM unit_aggregates WHERE device_id = 'D1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(harvested, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let res: Result<(), LedgerError> = in_immediate_transaction(&conn, |conn| {
            set_setting(conn, "aggregation", "last_run_date_id", "2026-03-01")?;
            Err(LedgerError::Validation("boom".into()))
        });
        assert!(res.is_err());
        assert!(get_setting(&conn, "aggregation", "last_run_date_id").is_none());

        let res: Result<(), LedgerError> = in_immediate_transaction(&conn, |conn| {
            set_setting(conn, "aggregation", "last_run_date_id", "2026-03-01")
        });
        assert!(res.is_ok());
        assert_eq!(
            get_setting(&conn, "aggregation", "last_run_date_id").as_deref(),
            Some("2026-03-01")
        );
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "aggregation", "last_run_date_id", "2026-03-01").expect("set");
        let val = get_setting(&conn, "aggregation", "last_run_date_id");
        assert_eq!(val, Some("2026-03-01".to_string()));

        set_setting(&conn, "aggregation", "last_run_date_id", "2026-03-02").expect("update");
        let val = get_setting(&conn, "aggregation", "last_run_date_id");
        assert_eq!(val, Some("2026-03-02".to_string()));

        assert!(get_setting(&conn, "aggregation", "missing").is_none());
    }
}
