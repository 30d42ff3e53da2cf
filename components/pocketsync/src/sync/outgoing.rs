/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The outgoing half of syncing: fold the unsynced change log into a net
// per-row effect, read the current row state for anything that still
// exists, and build the ChangeSet to upload.  After the server acks,
// `record_uploaded` flips the batch synced and advances the upload
// watermark.

use std::collections::HashMap;

use rusqlite::Connection;
use sync_guid::Guid;
use types::Timestamp;

use crate::db::row_to_json_object;
use crate::error::*;
use crate::schema::GLOBAL_ID_COLUMN;
use crate::storage::{changes, device};
use crate::sync::record::{ChangeSet, WireRow, CHANGE_SET_VERSION};
use crate::sync::RowLocks;

#[derive(Debug)]
pub struct OutgoingBatch {
    pub change_set: ChangeSet,
    /// Every change-log id covered by this batch - including ones whose row
    /// folded away entirely.  All of them flip to synced on ack.
    pub ids: Vec<i64>,
    /// The largest captured timestamp in the batch; becomes
    /// `last_upload_timestamp` on ack.
    pub max_timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NetEffect {
    Insert,
    Update,
    Delete,
    /// INSERT then DELETE inside one batch - the server never needs to hear
    /// about this row.
    Dropped,
}

impl NetEffect {
    /// Fold the next captured operation into the running net effect, per
    /// the upload contract: INSERT+DELETE disappears, INSERT+UPDATE stays
    /// an INSERT with final state, UPDATE+DELETE becomes a DELETE, and a
    /// row re-created after a DELETE surfaces as an UPDATE.
    fn fold(self, next: changes::Operation) -> NetEffect {
        use crate::storage::changes::Operation::*;
        match (self, next) {
            (NetEffect::Insert, Delete) => NetEffect::Dropped,
            (NetEffect::Insert, _) => NetEffect::Insert,
            (NetEffect::Update, Delete) => NetEffect::Delete,
            (NetEffect::Update, _) => NetEffect::Update,
            (NetEffect::Delete, Insert) | (NetEffect::Delete, Update) => NetEffect::Update,
            (NetEffect::Delete, Delete) => NetEffect::Delete,
            (NetEffect::Dropped, Insert) => NetEffect::Insert,
            (NetEffect::Dropped, other) => {
                // The row was born and killed in this batch; anything else
                // arriving for it implies capture out of order.  Shrug and
                // treat it like a fresh start.
                log::warn!("unexpected {:?} after a dropped row", other);
                NetEffect::Update
            }
        }
    }

    fn start(op: changes::Operation) -> NetEffect {
        match op {
            changes::Operation::Insert => NetEffect::Insert,
            changes::Operation::Update => NetEffect::Update,
            changes::Operation::Delete => NetEffect::Delete,
        }
    }
}

struct FoldedRow {
    table: String,
    global_id: Guid,
    net: NetEffect,
    latest_timestamp: Timestamp,
}

/// Read up to `limit` unsynced changes and shape them for upload.  Returns
/// None when there's nothing to send (which includes "everything folded
/// away").
pub fn collect_outgoing(
    conn: &Connection,
    row_locks: &RowLocks,
    limit: usize,
) -> Result<Option<OutgoingBatch>> {
    let unsynced = changes::unsynced_changes(conn, limit)?;
    if unsynced.is_empty() {
        return Ok(None);
    }

    // Fold in (timestamp, id) order to a net effect per row.  The Vec keeps
    // first-seen order so the upload is deterministic.
    let mut order: Vec<(String, Guid)> = Vec::new();
    let mut folded: HashMap<(String, Guid), FoldedRow> = HashMap::new();
    let mut ids = Vec::with_capacity(unsynced.len());
    let mut max_timestamp = Timestamp::EPOCH;
    for change in unsynced {
        ids.push(change.id);
        max_timestamp = max_timestamp.max(change.timestamp);
        let key = (change.table_name.clone(), change.record_rowid.clone());
        match folded.get_mut(&key) {
            Some(row) => {
                row.net = row.net.fold(change.operation);
                row.latest_timestamp = row.latest_timestamp.max(change.timestamp);
            }
            None => {
                order.push(key.clone());
                folded.insert(
                    key,
                    FoldedRow {
                        table: change.table_name,
                        global_id: change.record_rowid,
                        net: NetEffect::start(change.operation),
                        latest_timestamp: change.timestamp,
                    },
                );
            }
        }
    }

    let mut change_set = ChangeSet::new(Timestamp::now());
    for key in order {
        let row = &folded[&key];
        let wire = match row.net {
            NetEffect::Dropped => continue,
            NetEffect::Delete => WireRow {
                primary_key: row.global_id.clone(),
                data: Default::default(),
                timestamp: row.latest_timestamp,
                version: CHANGE_SET_VERSION,
            },
            NetEffect::Insert | NetEffect::Update => {
                let _guard = row_locks.lock(&row.table, &row.global_id);
                match read_row_state(conn, &row.table, &row.global_id)? {
                    Some(data) => WireRow {
                        primary_key: row.global_id.clone(),
                        data,
                        timestamp: row.latest_timestamp,
                        version: CHANGE_SET_VERSION,
                    },
                    None => {
                        // Deleted since this batch was read; the DELETE
                        // change that must follow will ship the tombstone.
                        log::debug!(
                            "row '{}' of '{}' vanished before upload; skipping",
                            row.global_id,
                            row.table
                        );
                        continue;
                    }
                }
            }
        };
        let group = match row.net {
            NetEffect::Insert => &mut change_set.insertions,
            NetEffect::Update => &mut change_set.updates,
            NetEffect::Delete => &mut change_set.deletions,
            NetEffect::Dropped => unreachable!(),
        };
        group.entry(row.table.clone()).or_default().push(wire);
    }

    Ok(Some(OutgoingBatch {
        change_set,
        ids,
        max_timestamp,
    }))
}

/// The current column state of one row, minus our id column (it travels as
/// `primary_key`).
fn read_row_state(
    conn: &Connection,
    table: &str,
    global_id: &Guid,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    use sql_support::ConnExt;
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE {} = :gid",
        table.replace('"', "\"\""),
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

/// Server acked the batch: flip it synced and advance the watermark.
pub fn record_uploaded(conn: &Connection, batch: &OutgoingBatch) -> Result<()> {
    changes::mark_synced(conn, &batch.ids)?;
    device::set_last_upload(conn, batch.max_timestamp)?;
    log::debug!(
        "recorded upload of {} change(s) through {}",
        batch.ids.len(),
        batch.max_timestamp
    );
    Ok(())
}
