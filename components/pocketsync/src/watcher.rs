/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Live queries.  A watcher owns a SQL statement, its bound arguments, and
// the tables it reads (derived statically); subscribers get the current
// result set on registration and a fresh one whenever a dependency table is
// notified.  Several subscribers can share one watcher.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value as JsonValue;

use crate::db::{row_to_json_object, SyncConnection};
use crate::error::*;
use crate::notifier::{NotifierSink, TableChange};
use crate::sql_extract::referenced_tables;

/// What subscribers receive.  Errors during re-evaluation are delivered as
/// events rather than tearing the watcher down; the next notification
/// re-attempts the query.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A fresh result set; each row is a JSON object keyed by column name.
    Rows(Vec<JsonValue>),
    Error {
        message: String,
    },
}

struct Subscriber {
    id: u64,
    sender: Sender<WatchEvent>,
}

struct Watcher {
    key: String,
    sql: String,
    params: Vec<SqlValue>,
    tables: HashSet<String>,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct RegistryState {
    watchers: HashMap<u64, Watcher>,
    next_watcher_id: u64,
    next_subscriber_id: u64,
}

pub struct WatcherRegistry {
    db: Arc<SyncConnection>,
    state: Mutex<RegistryState>,
}

impl WatcherRegistry {
    pub fn new(db: Arc<SyncConnection>) -> Arc<Self> {
        Arc::new(Self {
            db,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Register a live query.  The handle's channel already contains the
    /// current result set.  An initial query failure is returned to the
    /// caller directly - there's no stream yet to deliver it on.
    pub fn watch(
        self: &Arc<Self>,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<WatchHandle> {
        let initial = {
            let conn = self.db.lock();
            run_query(&conn, sql, &params)?
        };
        let key = watcher_key(sql, &params);
        let (sender, receiver) = unbounded();
        let mut state = self.state.lock();
        let subscriber_id = state.next_subscriber_id;
        state.next_subscriber_id += 1;

        let watcher_id = match state
            .watchers
            .iter()
            .find(|(_, w)| w.key == key)
            .map(|(id, _)| *id)
        {
            Some(id) => id,
            None => {
                let id = state.next_watcher_id;
                state.next_watcher_id += 1;
                state.watchers.insert(
                    id,
                    Watcher {
                        key,
                        sql: sql.to_owned(),
                        params: params.clone(),
                        tables: referenced_tables(sql),
                        subscribers: Vec::new(),
                    },
                );
                id
            }
        };
        let _ = sender.send(WatchEvent::Rows(initial));
        state
            .watchers
            .get_mut(&watcher_id)
            .expect("watcher just ensured")
            .subscribers
            .push(Subscriber {
                id: subscriber_id,
                sender,
            });
        log::debug!(
            "watcher {} gained subscriber {} ({})",
            watcher_id,
            subscriber_id,
            sql
        );
        Ok(WatchHandle {
            watcher_id,
            subscriber_id,
            receiver,
            registry: Arc::downgrade(self),
        })
    }

    /// Re-run every watcher that depends on one of the changed tables and
    /// broadcast the results.
    pub fn tables_changed(&self, changes: &[TableChange]) {
        let changed: HashSet<&str> = changes.iter().map(|c| c.table.as_str()).collect();
        let mut state = self.state.lock();
        // Collect first: broadcasting can remove dead subscribers.
        let affected: Vec<u64> = state
            .watchers
            .iter()
            .filter(|(_, w)| w.tables.iter().any(|t| changed.contains(t.as_str())))
            .map(|(id, _)| *id)
            .collect();
        for id in affected {
            let (sql, params) = {
                let w = &state.watchers[&id];
                (w.sql.clone(), w.params.clone())
            };
            let event = {
                let conn = self.db.lock();
                match run_query(&conn, &sql, &params) {
                    Ok(rows) => WatchEvent::Rows(rows),
                    Err(e) => {
                        log::warn!("watcher query failed, keeping watcher: {}", e);
                        WatchEvent::Error {
                            message: e.to_string(),
                        }
                    }
                }
            };
            let mut now_empty = false;
            if let Some(w) = state.watchers.get_mut(&id) {
                w.subscribers
                    .retain(|s| s.sender.send(event.clone()).is_ok());
                now_empty = w.subscribers.is_empty();
            }
            if now_empty {
                state.watchers.remove(&id);
            }
        }
    }

    /// Remove one subscriber; drops the watcher once nobody is listening.
    /// Idempotent.
    pub fn dispose(&self, watcher_id: u64, subscriber_id: u64) {
        let mut state = self.state.lock();
        let mut now_empty = false;
        if let Some(w) = state.watchers.get_mut(&watcher_id) {
            w.subscribers.retain(|s| s.id != subscriber_id);
            now_empty = w.subscribers.is_empty();
        }
        if now_empty {
            state.watchers.remove(&watcher_id);
        }
    }

    /// Drop every watcher and close their channels.  Used by dispose().
    pub fn clear(&self) {
        self.state.lock().watchers.clear();
    }

    #[cfg(test)]
    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }
}

/// Notifier sink: any change, local or remote, re-evaluates watchers.
pub struct WatcherSink(pub Arc<WatcherRegistry>);

impl NotifierSink for WatcherSink {
    fn tables_changed(&self, changes: &[TableChange]) {
        self.0.tables_changed(changes);
    }
}

fn watcher_key(sql: &str, params: &[SqlValue]) -> String {
    format!("{}|{:?}", sql, params)
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<JsonValue>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_and_then(rusqlite::params_from_iter(params.iter()), |row| {
        row_to_json_object(row).map(JsonValue::Object)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// The subscriber's end of a watcher.  Dropping it (or calling `dispose`)
/// unregisters the subscription.
pub struct WatchHandle {
    watcher_id: u64,
    subscriber_id: u64,
    receiver: Receiver<WatchEvent>,
    registry: Weak<WatcherRegistry>,
}

impl WatchHandle {
    pub fn receiver(&self) -> &Receiver<WatchEvent> {
        &self.receiver
    }

    pub fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.dispose(self.watcher_id, self.subscriber_id);
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::new_mem_connection;
    use crate::storage::changes::Operation;

    fn change(table: &str) -> TableChange {
        TableChange {
            table: table.into(),
            operations: vec![Operation::Insert],
            has_local: true,
            has_remote: false,
        }
    }

    fn setup() -> (Arc<SyncConnection>, Arc<WatcherRegistry>) {
        let db = Arc::new(new_mem_connection());
        db.lock()
            .execute_batch(
                "CREATE TABLE todos (title TEXT);
                 CREATE TABLE lists (name TEXT);",
            )
            .unwrap();
        let registry = WatcherRegistry::new(db.clone());
        (db, registry)
    }

    #[test]
    fn test_initial_results_and_reactivity() {
        let (db, registry) = setup();
        db.lock()
            .execute("INSERT INTO todos (title) VALUES ('first')", [])
            .unwrap();

        let handle = registry
            .watch("SELECT title FROM todos ORDER BY title", vec![])
            .unwrap();
        match handle.receiver().try_recv().unwrap() {
            WatchEvent::Rows(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0]["title"], "first");
            }
            other => panic!("expected rows, got {:?}", other),
        }

        db.lock()
            .execute("INSERT INTO todos (title) VALUES ('second')", [])
            .unwrap();
        registry.tables_changed(&[change("todos")]);
        match handle.receiver().try_recv().unwrap() {
            WatchEvent::Rows(rows) => assert_eq!(rows.len(), 2),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_unrelated_table_does_not_fire() {
        let (_db, registry) = setup();
        let handle = registry.watch("SELECT * FROM todos", vec![]).unwrap();
        let _ = handle.receiver().try_recv().unwrap(); // initial
        registry.tables_changed(&[change("lists")]);
        assert!(handle.receiver().try_recv().is_err());
    }

    #[test]
    fn test_bound_params() {
        let (db, registry) = setup();
        db.lock()
            .execute_batch(
                "INSERT INTO todos (title) VALUES ('keep'), ('drop');",
            )
            .unwrap();
        let handle = registry
            .watch(
                "SELECT title FROM todos WHERE title = ?",
                vec![SqlValue::Text("keep".into())],
            )
            .unwrap();
        match handle.receiver().try_recv().unwrap() {
            WatchEvent::Rows(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0]["title"], "keep");
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_error_event_keeps_watcher() {
        let (db, registry) = setup();
        let handle = registry.watch("SELECT * FROM todos", vec![]).unwrap();
        let _ = handle.receiver().try_recv().unwrap();

        // Break the query out from under the watcher.
        db.lock().execute_batch("DROP TABLE todos").unwrap();
        registry.tables_changed(&[change("todos")]);
        match handle.receiver().try_recv().unwrap() {
            WatchEvent::Error { .. } => {}
            other => panic!("expected error event, got {:?}", other),
        }
        assert_eq!(registry.watcher_count(), 1);

        // Recreate it; the next notification works again.
        db.lock()
            .execute_batch("CREATE TABLE todos (title TEXT)")
            .unwrap();
        registry.tables_changed(&[change("todos")]);
        match handle.receiver().try_recv().unwrap() {
            WatchEvent::Rows(rows) => assert!(rows.is_empty()),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_subscriber_broadcast() {
        let (db, registry) = setup();
        let first = registry.watch("SELECT * FROM todos", vec![]).unwrap();
        let second = registry.watch("SELECT * FROM todos", vec![]).unwrap();
        // Shared watcher, independent channels.
        assert_eq!(registry.watcher_count(), 1);
        let _ = first.receiver().try_recv().unwrap();
        let _ = second.receiver().try_recv().unwrap();

        db.lock()
            .execute("INSERT INTO todos (title) VALUES ('x')", [])
            .unwrap();
        registry.tables_changed(&[change("todos")]);
        assert!(matches!(
            first.receiver().try_recv().unwrap(),
            WatchEvent::Rows(_)
        ));
        assert!(matches!(
            second.receiver().try_recv().unwrap(),
            WatchEvent::Rows(_)
        ));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (_db, registry) = setup();
        let handle = registry.watch("SELECT * FROM todos", vec![]).unwrap();
        assert_eq!(registry.watcher_count(), 1);
        handle.dispose();
        handle.dispose();
        assert_eq!(registry.watcher_count(), 0);
        // Notifications after disposal are ignored.
        registry.tables_changed(&[change("todos")]);
    }
}
