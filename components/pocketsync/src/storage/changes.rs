/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The change log: reading what the triggers captured, flipping rows to
// synced after upload, pruning, and the processed-changes idempotence guard
// for the download side.

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use sql_support::ConnExt;
use sync_guid::Guid;
use types::Timestamp;

use crate::error::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(Error::Schema(format!("unknown operation: {}", other))),
        }
    }
}

/// One captured mutation, as the triggers wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub id: i64,
    pub table_name: String,
    pub record_rowid: Guid,
    pub operation: Operation,
    pub timestamp: Timestamp,
}

fn change_from_row(row: &Row<'_>) -> Result<ChangeRecord> {
    Ok(ChangeRecord {
        id: row.get("id")?,
        table_name: row.get("table_name")?,
        record_rowid: row.get("record_rowid")?,
        operation: Operation::from_str(&row.get::<_, String>("operation")?)?,
        timestamp: row.get("timestamp")?,
    })
}

/// Unsynced changes in upload order: `(timestamp ASC, id ASC)`.  This is
/// the total order the server sees.
pub fn unsynced_changes(conn: &Connection, limit: usize) -> Result<Vec<ChangeRecord>> {
    conn.query_rows_and_then_cached(
        "SELECT id, table_name, record_rowid, operation, timestamp
         FROM __pocketsync_changes
         WHERE synced = 0
         ORDER BY timestamp ASC, id ASC
         LIMIT :limit",
        rusqlite::named_params! { ":limit": limit as i64 },
        change_from_row,
    )
}

/// Flip the listed ids to synced in a single transaction.  Synced rows are
/// never flipped back.
pub fn mark_synced(conn: &Connection, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let tx = conn.unchecked_transaction()?;
    for id in ids {
        tx.execute_cached(
            "UPDATE __pocketsync_changes SET synced = 1 WHERE id = :id",
            rusqlite::named_params! { ":id": id },
        )?;
    }
    tx.commit()?;
    log::debug!("marked {} change(s) synced", ids.len());
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Unsynced rows dropped because the queue outgrew the hard cap.
    pub dropped_overflow: usize,
    /// Synced rows dropped because they aged past the retention window.
    pub dropped_expired: usize,
}

/// Enforce the queue cap and the retention window.  `protected` is the set
/// of change ids an in-flight upload refers to; those are never dropped no
/// matter how old.
pub fn prune(
    conn: &Connection,
    hard_cap: usize,
    retention_cutoff: Timestamp,
    protected: &[i64],
) -> Result<PruneStats> {
    let protected_clause = if protected.is_empty() {
        String::new()
    } else {
        let ids: Vec<String> = protected.iter().map(|id| id.to_string()).collect();
        format!(" AND id NOT IN ({})", ids.join(","))
    };

    let tx = conn.unchecked_transaction()?;
    let unsynced: usize = tx.query_row(
        "SELECT COUNT(*) FROM __pocketsync_changes WHERE synced = 0",
        [],
        |r| r.get::<_, i64>(0).map(|n| n as usize),
    )?;
    let dropped_overflow = if unsynced > hard_cap {
        let excess = unsynced - hard_cap;
        tx.execute(
            &format!(
                "DELETE FROM __pocketsync_changes WHERE id IN (
                     SELECT id FROM __pocketsync_changes
                     WHERE synced = 0{}
                     ORDER BY timestamp ASC, id ASC
                     LIMIT {})",
                protected_clause, excess
            ),
            [],
        )?
    } else {
        0
    };
    let dropped_expired = tx.execute(
        &format!(
            "DELETE FROM __pocketsync_changes
             WHERE synced = 1 AND timestamp < {}{}",
            retention_cutoff.as_millis_i64(),
            protected_clause
        ),
        [],
    )?;
    tx.commit()?;
    if dropped_overflow > 0 {
        log::warn!(
            "change queue over hard cap; dropped the {} oldest unsynced change(s)",
            dropped_overflow
        );
    }
    Ok(PruneStats {
        dropped_overflow,
        dropped_expired,
    })
}

/// Has this remote change log already been applied?
pub fn is_remote_applied(conn: &Connection, change_log_id: &str) -> Result<bool> {
    Ok(conn.exists(
        "SELECT 1 FROM __pocketsync_processed_changes WHERE change_log_id = :id",
        rusqlite::named_params! { ":id": change_log_id },
    )?)
}

/// Record a remote change log as applied.  Runs inside the transaction that
/// applies its data, so the guard and the data land atomically.
pub fn register_remote_applied(conn: &Connection, change_log_id: &str) -> Result<()> {
    conn.execute_cached(
        "INSERT OR IGNORE INTO __pocketsync_processed_changes (change_log_id, applied_at)
         VALUES (:id, :now)",
        rusqlite::named_params! { ":id": change_log_id, ":now": Timestamp::now() },
    )?;
    Ok(())
}

pub fn pending_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM __pocketsync_changes WHERE synced = 0",
        [],
        |r| r.get(0),
    )?)
}

pub fn oldest_pending_timestamp(conn: &Connection) -> Result<Option<Timestamp>> {
    Ok(conn.try_query_one(
        "SELECT MIN(timestamp) FROM __pocketsync_changes WHERE synced = 0",
        [],
        true,
    )?)
}

/// The most recent captured change for a row, synced or not.  This is the
/// "local timestamp" conflict resolution compares against.
pub fn latest_change_timestamp(
    conn: &Connection,
    table: &str,
    global_id: &Guid,
) -> Result<Option<Timestamp>> {
    Ok(conn.try_query_one(
        "SELECT MAX(timestamp) FROM __pocketsync_changes
         WHERE table_name = :table AND record_rowid = :gid",
        rusqlite::named_params! { ":table": table, ":gid": global_id },
        true,
    )?)
}

pub fn max_change_id(conn: &Connection) -> Result<i64> {
    Ok(conn.try_query_one("SELECT MAX(id) FROM __pocketsync_changes", [], true)?
        .unwrap_or(0))
}

/// Which tables gained changes after `since_id`, and with which operations.
/// Used to drive notifications for raw statements and transactions, where
/// the affected tables aren't known up front.
pub fn changes_since(conn: &Connection, since_id: i64) -> Result<Vec<(String, Operation)>> {
    conn.query_rows_and_then_cached(
        "SELECT DISTINCT table_name, operation FROM __pocketsync_changes
         WHERE id > :since",
        rusqlite::named_params! { ":since": since_id },
        |row| -> Result<(String, Operation)> {
            Ok((
                row.get(0)?,
                Operation::from_str(&row.get::<_, String>(1)?)?,
            ))
        },
    )
}
