/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The incoming half of syncing: apply remote change logs, in server order,
// through the conflict resolver, on the dedicated sync connection with
// capture suppressed.  Each log applies in one transaction together with
// its `__pocketsync_processed_changes` entry, so replays are no-ops.

use std::collections::HashMap;

use interrupt_support::Interruptee;
use rusqlite::Connection;
use sync_guid::Guid;
use types::Timestamp;

use crate::conflict::{ConflictResolver, RowVersion};
use crate::db::{json_to_sql, row_to_json_object, SyncConnection};
use crate::error::*;
use crate::schema::{quote_ident, table_columns, GLOBAL_ID_COLUMN};
use crate::storage::changes::{self, Operation};
use crate::sync::record::ChangeLog;
use crate::sync::RowLocks;

#[derive(Debug, Default)]
pub struct ApplyStats {
    pub applied_logs: usize,
    pub skipped_logs: usize,
    /// Tables that actually changed, with the operation applied.  Drives
    /// watcher notifications (flagged remote).
    pub changed_tables: Vec<(String, Operation)>,
    /// The largest server timestamp observed; becomes
    /// `last_download_timestamp`.
    pub max_timestamp: Option<Timestamp>,
    /// Set when a custom resolver refused a row.  Everything before the
    /// offending log was applied; it and everything after will be retried
    /// on the next pass.
    pub unresolved: Option<String>,
}

impl ApplyStats {
    fn advance(&mut self, ts: Timestamp) {
        self.max_timestamp = Some(self.max_timestamp.map_or(ts, |cur| cur.max(ts)));
    }
}

pub fn apply_change_logs(
    db: &SyncConnection,
    resolver: &ConflictResolver,
    row_locks: &RowLocks,
    own_device_id: &str,
    logs: &[ChangeLog],
    signal: &dyn Interruptee,
) -> Result<ApplyStats> {
    let mut stats = ApplyStats::default();
    for log in logs {
        signal.err_if_interrupted()?;
        if log.device_id == own_device_id {
            // Our own upload echoed back; it's already local data.
            let conn = db.lock();
            changes::register_remote_applied(&conn, &log.id)?;
            stats.skipped_logs += 1;
            stats.advance(log.processed_at);
            continue;
        }
        match apply_one_log(db, resolver, row_locks, log, &mut stats) {
            Ok(true) => {
                stats.applied_logs += 1;
                stats.advance(log.processed_at);
            }
            Ok(false) => {
                stats.skipped_logs += 1;
                stats.advance(log.processed_at);
            }
            Err(Error::Conflict {
                table,
                global_id,
                reason,
            }) => {
                // Leave this log unprocessed and stop: the watermark must
                // not advance past it or it would never be retried.
                log::warn!(
                    "unresolved conflict on '{}' row '{}' ({}); will retry next pass",
                    table,
                    global_id,
                    reason
                );
                stats.unresolved = Some(reason);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}

/// Apply a single change log.  Returns false when the idempotence guard
/// says it already ran.
fn apply_one_log(
    db: &SyncConnection,
    resolver: &ConflictResolver,
    row_locks: &RowLocks,
    log: &ChangeLog,
    stats: &mut ApplyStats,
) -> Result<bool> {
    db.with_suppressed(|conn| {
        if changes::is_remote_applied(conn, &log.id)? {
            log::debug!("change log '{}' already applied; skipping", log.id);
            return Ok(false);
        }
        let tx = conn.unchecked_transaction()?;
        let mut column_cache: HashMap<String, Vec<String>> = HashMap::new();
        for (table, global_id, remote) in flatten(log) {
            let _guard = row_locks.lock(&table, &global_id);
            let local_data = read_local_row(&tx, &table, &global_id)?;
            let local_ts = changes::latest_change_timestamp(&tx, &table, &global_id)?;
            // A row we've never seen isn't a conflict - the remote version
            // applies as-is.  Only a live local row or a locally-deleted
            // one (absent row with change history) goes through the
            // resolver.
            let local = match (local_data, local_ts) {
                (Some(data), ts) => {
                    RowVersion::new(global_id.clone(), data, ts.unwrap_or(Timestamp::EPOCH))
                }
                (None, Some(ts)) => RowVersion::tombstone(global_id.clone(), ts),
                (None, None) => {
                    let applied =
                        write_resolved(&tx, &table, &global_id, &remote, &mut column_cache)?;
                    if let Some(op) = applied {
                        stats.changed_tables.push((table.clone(), op));
                    }
                    continue;
                }
            };
            let resolved = resolver.resolve(&table, &local, &remote)?;
            if resolved == local {
                continue;
            }
            let applied = write_resolved(&tx, &table, &global_id, &resolved, &mut column_cache)?;
            if let Some(op) = applied {
                stats.changed_tables.push((table.clone(), op));
            }
        }
        changes::register_remote_applied(&tx, &log.id)?;
        tx.commit()?;
        Ok(true)
    })
}

/// Flatten a change set into one remote version per row, first-seen order.
/// When a row appears in several groups, the one with the latest timestamp
/// stands; deletions win ties.
fn flatten(log: &ChangeLog) -> Vec<(String, Guid, RowVersion)> {
    let mut order: Vec<(String, Guid)> = Vec::new();
    let mut latest: HashMap<(String, Guid), RowVersion> = HashMap::new();
    let mut absorb = |table: &String, version: RowVersion| {
        let key = (table.clone(), version.global_id.clone());
        match latest.get_mut(&key) {
            Some(existing) => {
                let replace = version.timestamp > existing.timestamp
                    || (version.timestamp == existing.timestamp && version.is_tombstone());
                if replace {
                    *existing = version;
                }
            }
            None => {
                order.push(key.clone());
                latest.insert(key, version);
            }
        }
    };
    for (table, rows) in log
        .change_set
        .insertions
        .iter()
        .chain(log.change_set.updates.iter())
    {
        for row in rows {
            absorb(
                table,
                RowVersion::new(row.primary_key.clone(), row.data.clone(), row.timestamp),
            );
        }
    }
    for (table, rows) in &log.change_set.deletions {
        for row in rows {
            absorb(
                table,
                RowVersion::tombstone(row.primary_key.clone(), row.timestamp),
            );
        }
    }
    order
        .into_iter()
        .map(|(table, gid)| {
            let version = latest
                .remove(&(table.clone(), gid.clone()))
                .expect("flattened row must exist");
            (table, gid, version)
        })
        .collect()
}

fn read_local_row(
    conn: &Connection,
    table: &str,
    global_id: &Guid,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    use sql_support::ConnExt;
    let sql = format!(
        "SELECT * FROM {} WHERE {} = :gid",
        quote_ident(table),
        GLOBAL_ID_COLUMN
    );
    let mut state: Option<serde_json::Map<_, _>> = conn.try_query_row(
        &sql,
        rusqlite::named_params! { ":gid": global_id },
        |row| -> Result<_> { Ok(row_to_json_object(row)?) },
        true,
    )?;
    if let Some(map) = state.as_mut() {
        map.remove(GLOBAL_ID_COLUMN);
    }
    Ok(state)
}

/// Write the resolver's pick back to the table.  Returns the operation
/// performed, or None when there was nothing to do (e.g. deleting an
/// already-absent row).
fn write_resolved(
    conn: &Connection,
    table: &str,
    global_id: &Guid,
    resolved: &RowVersion,
    column_cache: &mut HashMap<String, Vec<String>>,
) -> Result<Option<Operation>> {
    use sql_support::ConnExt;
    let quoted = quote_ident(table);
    if resolved.is_tombstone() {
        let deleted = conn.execute_cached(
            &format!("DELETE FROM {} WHERE {} = :gid", quoted, GLOBAL_ID_COLUMN),
            rusqlite::named_params! { ":gid": global_id },
        )?;
        return Ok((deleted > 0).then_some(Operation::Delete));
    }

    let table_columns = match column_cache.get(table) {
        Some(cols) => cols.clone(),
        None => {
            let cols = table_columns(conn, table)?;
            column_cache.insert(table.to_owned(), cols.clone());
            cols
        }
    };
    let data = resolved.data.as_ref().expect("not a tombstone");
    // Unknown columns (schema drift between devices) are dropped; missing
    // ones keep their defaults.
    let columns: Vec<&String> = data
        .keys()
        .filter(|c| c.as_str() != GLOBAL_ID_COLUMN && table_columns.contains(c))
        .collect();

    let exists = conn.exists(
        &format!("SELECT 1 FROM {} WHERE {} = :gid", quoted, GLOBAL_ID_COLUMN),
        rusqlite::named_params! { ":gid": global_id },
    )?;
    let mut params: Vec<rusqlite::types::Value> =
        columns.iter().map(|c| json_to_sql(&data[c.as_str()])).collect();
    params.push(rusqlite::types::Value::Text(global_id.to_string()));
    if exists {
        if columns.is_empty() {
            return Ok(None);
        }
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect();
        conn.execute(
            &format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                quoted,
                assignments.join(", "),
                GLOBAL_ID_COLUMN,
                columns.len() + 1
            ),
            rusqlite::params_from_iter(params),
        )?;
        Ok(Some(Operation::Update))
    } else {
        let mut names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        names.push(GLOBAL_ID_COLUMN.to_owned());
        let placeholders: Vec<String> =
            (1..=names.len()).map(|i| format!("?{}", i)).collect();
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quoted,
                names.join(", "),
                placeholders.join(", ")
            ),
            rusqlite::params_from_iter(params),
        )?;
        Ok(Some(Operation::Insert))
    }
}
