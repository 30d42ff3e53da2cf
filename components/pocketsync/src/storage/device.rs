/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Device state: the stable per-install identifier and the sync watermarks.
// A single row, read-modify-write, with monotonic timestamp setters.

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use sql_support::ConnExt;
use sync_guid::Guid;
use types::Timestamp;

use crate::error::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub device_id: String,
    pub last_upload_timestamp: Option<Timestamp>,
    pub last_download_timestamp: Option<Timestamp>,
    pub last_sync_status: Option<String>,
    pub last_cleanup_timestamp: Option<Timestamp>,
}

/// Hash whatever platform probe data the host gave us into a fixed-width
/// id.  Without a fingerprint we hash a random guid instead - still stable,
/// because the result is persisted and never recomputed.
fn derive_device_id(fingerprint: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    match fingerprint {
        Some(fp) => hasher.update(fp.as_bytes()),
        None => hasher.update(Guid::random().as_str().as_bytes()),
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn get(conn: &Connection) -> Result<Option<DeviceState>> {
    conn.try_query_row(
        "SELECT device_id, last_upload_timestamp, last_download_timestamp,
                last_sync_status, last_cleanup_timestamp
         FROM __pocketsync_device_state",
        [],
        |row| -> Result<DeviceState> {
            Ok(DeviceState {
                device_id: row.get(0)?,
                last_upload_timestamp: row.get(1)?,
                last_download_timestamp: row.get(2)?,
                last_sync_status: row.get(3)?,
                last_cleanup_timestamp: row.get(4)?,
            })
        },
        true,
    )
}

/// Fetch the device state, creating it on first run.
pub fn ensure(conn: &Connection, fingerprint: Option<&str>) -> Result<DeviceState> {
    if let Some(state) = get(conn)? {
        return Ok(state);
    }
    let device_id = derive_device_id(fingerprint);
    conn.execute(
        "INSERT INTO __pocketsync_device_state (device_id) VALUES (:id)",
        rusqlite::named_params! { ":id": device_id },
    )?;
    log::info!("created device state with id {}", device_id);
    get(conn)?.ok_or_else(|| Error::Schema("device state vanished after insert".into()))
}

fn set_timestamp(
    conn: &Connection,
    column: &'static str,
    proposed: Timestamp,
) -> Result<()> {
    let current: Option<Timestamp> = conn.try_query_one(
        &format!("SELECT {} FROM __pocketsync_device_state", column),
        [],
        false,
    )?;
    if let Some(current) = current {
        if proposed < current {
            return Err(Error::TimestampRegression {
                name: column,
                current,
                proposed,
            });
        }
    }
    conn.execute(
        &format!("UPDATE __pocketsync_device_state SET {} = :ts", column),
        rusqlite::named_params! { ":ts": proposed },
    )?;
    Ok(())
}

pub fn set_last_upload(conn: &Connection, ts: Timestamp) -> Result<()> {
    set_timestamp(conn, "last_upload_timestamp", ts)
}

pub fn set_last_download(conn: &Connection, ts: Timestamp) -> Result<()> {
    set_timestamp(conn, "last_download_timestamp", ts)
}

pub fn set_last_cleanup(conn: &Connection, ts: Timestamp) -> Result<()> {
    set_timestamp(conn, "last_cleanup_timestamp", ts)
}

pub fn set_sync_status(conn: &Connection, status: &str) -> Result<()> {
    conn.execute(
        "UPDATE __pocketsync_device_state SET last_sync_status = :status",
        rusqlite::named_params! { ":status": status },
    )?;
    Ok(())
}
