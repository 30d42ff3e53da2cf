/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Schema management: the internal bookkeeping tables, plus augmentation of
// the host's tables with `ps_global_id` and the three capture triggers.
//
// The host owns its own DDL.  We discover its tables from sqlite_master and
// bolt capture onto whatever we find, so augmentation has to be safe to
// re-run on every open.

use rusqlite::{Connection, Transaction};
use sql_support::open_database::{
    ConnectionInitializer, Error as MigrationError, Result as MigrationResult,
};
use sql_support::ConnExt;

use crate::error::*;

/// Bumping this re-runs pre-existing-data seeding for every table (the
/// `__pocketsync_processed_tables` guard is keyed on it).
pub const ENGINE_VERSION: i64 = 1;

/// Name prefix for everything we own inside the host's database.
pub const INTERNAL_PREFIX: &str = "__pocketsync_";

pub const GLOBAL_ID_COLUMN: &str = "ps_global_id";

const CREATE_CHANGES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS __pocketsync_changes (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name    TEXT NOT NULL,
        record_rowid  TEXT NOT NULL,
        operation     TEXT NOT NULL CHECK(operation IN ('INSERT','UPDATE','DELETE')),
        timestamp     INTEGER NOT NULL,
        synced        TINYINT NOT NULL DEFAULT 0
    );
";

const CREATE_CHANGES_INDEXES_SQL: &str = "
    CREATE INDEX IF NOT EXISTS idx_pocketsync_changes_table
        ON __pocketsync_changes(table_name);
    CREATE INDEX IF NOT EXISTS idx_pocketsync_changes_synced
        ON __pocketsync_changes(synced);
    CREATE INDEX IF NOT EXISTS idx_pocketsync_changes_timestamp
        ON __pocketsync_changes(timestamp);
";

const CREATE_DEVICE_STATE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS __pocketsync_device_state (
        device_id               TEXT PRIMARY KEY,
        last_upload_timestamp   INTEGER,
        last_download_timestamp INTEGER,
        last_sync_status        TEXT,
        last_cleanup_timestamp  INTEGER
    );
";

const CREATE_VERSION_SQL: &str = "
    CREATE TABLE IF NOT EXISTS __pocketsync_version (
        id                   INTEGER PRIMARY KEY CHECK(id = 1),
        engine_version       INTEGER NOT NULL,
        last_reset_timestamp INTEGER
    );
";

const CREATE_PROCESSED_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS __pocketsync_processed_tables (
        table_name     TEXT NOT NULL,
        engine_version INTEGER NOT NULL,
        processed_at   INTEGER NOT NULL,
        PRIMARY KEY (table_name, engine_version)
    );
";

const CREATE_PROCESSED_CHANGES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS __pocketsync_processed_changes (
        change_log_id TEXT PRIMARY KEY,
        applied_at    INTEGER NOT NULL
    );
";

pub struct SchemaInitializer;

impl ConnectionInitializer for SchemaInitializer {
    const NAME: &'static str = "pocketsync db";
    const END_VERSION: u32 = 1;

    fn prepare(&self, conn: &Connection, _db_empty: bool) -> MigrationResult<()> {
        let initial_pragmas = "
            -- We don't care about temp tables being persisted to disk.
            PRAGMA temp_store = 2;
            -- we unconditionally want write-ahead-logging mode.
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            -- the writer and the sync connection contend on the same file.
            PRAGMA busy_timeout = 5000;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn init(&self, db: &Transaction<'_>) -> MigrationResult<()> {
        log::debug!("Creating pocketsync bookkeeping tables");
        db.execute_all(&[
            CREATE_CHANGES_SQL,
            CREATE_CHANGES_INDEXES_SQL,
            CREATE_DEVICE_STATE_SQL,
            CREATE_VERSION_SQL,
            CREATE_PROCESSED_TABLES_SQL,
            CREATE_PROCESSED_CHANGES_SQL,
        ])?;
        Ok(())
    }

    fn upgrade_from(&self, _db: &Transaction<'_>, version: u32) -> MigrationResult<()> {
        Err(MigrationError::IncompatibleVersion(version))
    }
}

/// Double-quote an identifier for interpolation into SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The host's tables: everything in sqlite_master that isn't SQLite's or
/// ours.
pub fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let all: Vec<String> = conn.query_rows_and_then(
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        [],
        |row| -> Result<String> { Ok(row.get(0)?) },
    )?;
    Ok(all
        .into_iter()
        .filter(|name| !name.starts_with("sqlite_") && !name.starts_with(INTERNAL_PREFIX))
        .collect())
}

/// Column names of `table`, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    Ok(conn.query_rows_and_then(
        &format!("PRAGMA table_info({})", quote_ident(table)),
        [],
        |row| -> Result<String> { Ok(row.get("name")?) },
    )?)
}

/// Augment every user table and seed pre-existing rows.  Runs in a single
/// transaction - a failure part way through leaves the database untouched.
/// Returns the list of augmented tables.
pub fn augment_user_tables(conn: &Connection) -> Result<Vec<String>> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::Schema(format!("failed to start augmentation: {}", e)))?;
    tx.execute(
        "INSERT INTO __pocketsync_version (id, engine_version)
         VALUES (1, :version)
         ON CONFLICT(id) DO UPDATE SET engine_version = :version",
        rusqlite::named_params! { ":version": ENGINE_VERSION },
    )?;
    let tables = user_tables(&tx)?;
    for table in &tables {
        augment_table(&tx, table)?;
        if !table_is_seeded(&tx, table)? {
            seed_table(&tx, table, false)?;
        }
    }
    tx.commit()?;
    Ok(tables)
}

fn augment_table(conn: &Connection, table: &str) -> Result<()> {
    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(Error::Schema(format!("no such table: {}", table)));
    }
    if !columns.iter().any(|c| c == GLOBAL_ID_COLUMN) {
        log::debug!("Adding {} to '{}'", GLOBAL_ID_COLUMN, table);
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT;",
            quote_ident(table),
            GLOBAL_ID_COLUMN,
        ))?;
    }
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {}({});",
        quote_ident(&format!("idx_{}_ps_global_id", table)),
        quote_ident(table),
        GLOBAL_ID_COLUMN,
    ))?;
    create_triggers(conn, table, &columns)?;
    Ok(())
}

/// Install the three capture triggers for `table`.  Existing triggers are
/// replaced, so a changed table shape picks up a fresh UPDATE guard.
fn create_triggers(conn: &Connection, table: &str, columns: &[String]) -> Result<()> {
    let quoted = quote_ident(table);
    let insert_trigger = quote_ident(&format!("__pocketsync_{}_ai", table));
    let update_trigger = quote_ident(&format!("__pocketsync_{}_au", table));
    let delete_trigger = quote_ident(&format!("__pocketsync_{}_ad", table));

    // The inner UPDATE assigns an id to rows inserted without one.  With
    // recursive_triggers off (the SQLite default) it fires no triggers
    // itself, and the capture row reads the id back from the table so it
    // works whether the id was app-supplied or generated here.
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {insert_trigger};
         CREATE TRIGGER {insert_trigger}
         AFTER INSERT ON {quoted}
         FOR EACH ROW
         WHEN pocketsync_suppressed() = 0
         BEGIN
             UPDATE {quoted} SET {gid} = pocketsync_guid()
                 WHERE rowid = NEW.rowid AND {gid} IS NULL;
             INSERT INTO __pocketsync_changes (table_name, record_rowid, operation, timestamp, synced)
                 VALUES ('{table}',
                         (SELECT {gid} FROM {quoted} WHERE rowid = NEW.rowid),
                         'INSERT', pocketsync_now(), 0);
         END;",
        insert_trigger = insert_trigger,
        quoted = quoted,
        table = table.replace('\'', "''"),
        gid = GLOBAL_ID_COLUMN,
    ))?;

    // Only fire when something other than ps_global_id actually changed,
    // with IS NOT so NULL transitions count.
    let guards: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != GLOBAL_ID_COLUMN)
        .map(|c| {
            let q = quote_ident(c);
            format!("OLD.{q} IS NOT NEW.{q}", q = q)
        })
        .collect();
    if guards.is_empty() {
        // A table with no columns beyond our own has nothing to track.
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {};", update_trigger))?;
    } else {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {update_trigger};
             CREATE TRIGGER {update_trigger}
             AFTER UPDATE ON {quoted}
             FOR EACH ROW
             WHEN pocketsync_suppressed() = 0 AND ({guards})
             BEGIN
                 INSERT INTO __pocketsync_changes (table_name, record_rowid, operation, timestamp, synced)
                     VALUES ('{table}', NEW.{gid}, 'UPDATE', pocketsync_now(), 0);
             END;",
            update_trigger = update_trigger,
            quoted = quoted,
            table = table.replace('\'', "''"),
            gid = GLOBAL_ID_COLUMN,
            guards = guards.join(" OR "),
        ))?;
    }

    // Rows that never got an id (pre-augmentation deletes) have nothing to
    // sync, hence the IS NOT NULL guard.
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {delete_trigger};
         CREATE TRIGGER {delete_trigger}
         AFTER DELETE ON {quoted}
         FOR EACH ROW
         WHEN pocketsync_suppressed() = 0 AND OLD.{gid} IS NOT NULL
         BEGIN
             INSERT INTO __pocketsync_changes (table_name, record_rowid, operation, timestamp, synced)
                 VALUES ('{table}', OLD.{gid}, 'DELETE', pocketsync_now(), 0);
         END;",
        delete_trigger = delete_trigger,
        quoted = quoted,
        table = table.replace('\'', "''"),
        gid = GLOBAL_ID_COLUMN,
    ))?;
    Ok(())
}

fn table_is_seeded(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn.exists(
        "SELECT 1 FROM __pocketsync_processed_tables
         WHERE table_name = :table AND engine_version = :version",
        rusqlite::named_params! { ":table": table, ":version": ENGINE_VERSION },
    )?)
}

/// Assign ids to rows that predate augmentation and emit synthetic INSERT
/// changes for them, then mark the table processed.  With `all_rows` (used
/// by reset) every row gets a change entry, not just the newly-assigned
/// ones.
///
/// Must run inside the caller's transaction.
fn seed_table(conn: &Connection, table: &str, all_rows: bool) -> Result<()> {
    let quoted = quote_ident(table);
    // Remember which rows were missing an id, keyed by SQLite's implicit
    // rowid, before we assign anything.
    conn.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS pocketsync_seeding (rowid_val INTEGER PRIMARY KEY);
         DELETE FROM pocketsync_seeding;",
    )?;
    conn.execute(
        &format!(
            "INSERT INTO pocketsync_seeding (rowid_val)
             SELECT rowid FROM {} WHERE {} IS NULL",
            quoted, GLOBAL_ID_COLUMN
        ),
        [],
    )?;
    // pocketsync_guid() isn't flagged deterministic, so SQLite calls it per
    // row here.
    conn.execute(
        &format!(
            "UPDATE {} SET {gid} = pocketsync_guid() WHERE {gid} IS NULL",
            quoted,
            gid = GLOBAL_ID_COLUMN
        ),
        [],
    )?;
    let filter = if all_rows {
        String::new()
    } else {
        " WHERE rowid IN (SELECT rowid_val FROM pocketsync_seeding)".to_owned()
    };
    let seeded = conn.execute(
        &format!(
            "INSERT INTO __pocketsync_changes (table_name, record_rowid, operation, timestamp, synced)
             SELECT '{table}', {gid}, 'INSERT', pocketsync_now(), 0 FROM {quoted}{filter}",
            table = table.replace('\'', "''"),
            gid = GLOBAL_ID_COLUMN,
            quoted = quoted,
            filter = filter,
        ),
        [],
    )?;
    conn.execute_batch("DELETE FROM pocketsync_seeding;")?;
    conn.execute(
        "INSERT OR REPLACE INTO __pocketsync_processed_tables (table_name, engine_version, processed_at)
         VALUES (:table, :version, pocketsync_now())",
        rusqlite::named_params! { ":table": table, ":version": ENGINE_VERSION },
    )?;
    log::debug!("Seeded {} pre-existing row(s) of '{}'", seeded, table);
    Ok(())
}

/// Drop all change tracking and seed again as if freshly installed.
/// Destructive: every row is re-queued as an INSERT.  Existing
/// `ps_global_id`s are kept - they're immutable for the life of the row.
pub fn reset(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    let triggers: Vec<String> = tx.query_rows_and_then(
        "SELECT name FROM sqlite_master WHERE type = 'trigger'",
        [],
        |row| -> Result<String> { Ok(row.get(0)?) },
    )?;
    for trigger in triggers {
        if trigger.starts_with(INTERNAL_PREFIX) {
            tx.execute_batch(&format!("DROP TRIGGER IF EXISTS {};", quote_ident(&trigger)))?;
        }
    }
    tx.execute_all(&[
        "DELETE FROM __pocketsync_changes;",
        "DELETE FROM __pocketsync_processed_tables;",
        "DELETE FROM __pocketsync_processed_changes;",
        "UPDATE __pocketsync_device_state SET
            last_upload_timestamp = NULL,
            last_download_timestamp = NULL,
            last_sync_status = NULL,
            last_cleanup_timestamp = NULL;",
        "UPDATE __pocketsync_version SET last_reset_timestamp = pocketsync_now();",
    ])?;
    let tables = user_tables(&tx)?;
    for table in &tables {
        augment_table(&tx, table)?;
        seed_table(&tx, table, true)?;
    }
    tx.commit()?;
    log::info!("Reset change tracking for {} table(s)", tables.len());
    Ok(())
}
