/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags, Row};
use serde_json::{Map, Value as JsonValue};
use sql_support::open_database::open_database_with_flags;
use sync_guid::Guid;
use types::Timestamp;

use crate::error::*;
use crate::schema::SchemaInitializer;

/// The role of a connection.  We use two connections against the same file:
/// the writer for everything the host does (so the capture triggers fire),
/// and the syncer for applying remote changes (so they don't).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    ReadWrite,
    Sync,
}

impl ConnectionType {
    pub fn rusqlite_flags(&self) -> OpenFlags {
        let common_flags = OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        match self {
            ConnectionType::ReadWrite => {
                common_flags
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_READ_WRITE
            }
            ConnectionType::Sync => common_flags | OpenFlags::SQLITE_OPEN_READ_WRITE,
        }
    }
}

/// A connection with the PocketSync SQL functions defined on it, plus the
/// per-connection suppression flag those functions consult.  Triggers carry a
/// `WHEN pocketsync_suppressed() = 0` guard, so raising the flag on *this*
/// connection stops capture for writes made on it without affecting any
/// other connection to the same file.
pub struct SyncConnection {
    conn: Mutex<Connection>,
    suppressed: Arc<AtomicBool>,
    pub conn_type: ConnectionType,
}

impl SyncConnection {
    pub fn open(path: impl AsRef<Path>, conn_type: ConnectionType) -> Result<Self> {
        let suppressed = Arc::new(AtomicBool::new(false));
        let initializer = SchemaInitializer;
        let conn = open_database_with_flags(path, conn_type.rusqlite_flags(), &initializer)?;
        define_functions(&conn, &suppressed)?;
        Ok(Self {
            conn: Mutex::new(conn),
            suppressed,
            conn_type,
        })
    }

    /// Take the connection lock.  Held for the duration of a single
    /// operation or transaction; the two connections never wait on each
    /// other's lock.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` with capture suppressed on this connection.  The flag is
    /// always lowered again, even when `f` fails.
    pub fn with_suppressed<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        self.suppressed.store(true, Ordering::SeqCst);
        let result = f(&conn);
        self.suppressed.store(false, Ordering::SeqCst);
        result
    }

    #[cfg(test)]
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }
}

fn define_functions(c: &Connection, suppressed: &Arc<AtomicBool>) -> rusqlite::Result<()> {
    c.create_scalar_function("pocketsync_guid", 0, FunctionFlags::SQLITE_UTF8, |_| {
        Ok(Guid::random().into_string())
    })?;
    c.create_scalar_function("pocketsync_now", 0, FunctionFlags::SQLITE_UTF8, |_| {
        Ok(Timestamp::now().as_millis_i64())
    })?;
    let flag = Arc::clone(suppressed);
    c.create_scalar_function(
        "pocketsync_suppressed",
        0,
        FunctionFlags::SQLITE_UTF8,
        move |_| Ok(flag.load(Ordering::SeqCst) as i64),
    )?;
    Ok(())
}

/// Convert one column of a result row into JSON.  Blobs become base64 text,
/// which is also how they travel on the wire.
pub fn column_to_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<JsonValue> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => JsonValue::from(f),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(STANDARD.encode(b)),
    })
}

/// Convert a full result row into a JSON object keyed by column name.
pub fn row_to_json_object(row: &Row<'_>) -> rusqlite::Result<Map<String, JsonValue>> {
    let mut object = Map::new();
    for (idx, name) in row.as_ref().column_names().into_iter().enumerate() {
        object.insert(name.to_owned(), column_to_json(row, idx)?);
    }
    Ok(object)
}

/// Convert a JSON value into something bindable.  Arrays and nested objects
/// are stored as their JSON text, which is what the capture side produces
/// for them too.
pub fn json_to_sql(value: &JsonValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static MEM_COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// A fresh named in-memory database.  Named + shared-cache so that a
    /// second connection (the syncer) sees the same data.
    pub fn new_mem_path() -> String {
        let count = MEM_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("file:pocketsync-test-{}?mode=memory&cache=shared", count)
    }

    pub fn new_mem_connection() -> SyncConnection {
        SyncConnection::open(new_mem_path(), ConnectionType::ReadWrite).unwrap()
    }
}
