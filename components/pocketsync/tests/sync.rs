/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// End-to-end boundary scenarios, driven entirely through the public API
// with an in-memory fake transport standing in for the coordinator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value as JsonValue};
use types::Timestamp;

use pocketsync::{
    ChangeLog, ChangeSet, PocketSync, SyncOptions, Transport, UploadAck, WireRow,
};

#[derive(Default)]
struct FakeTransport {
    online: AtomicBool,
    sent: Mutex<Vec<ChangeSet>>,
    queued: Mutex<Vec<ChangeLog>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        let t = Self::default();
        t.online.store(true, Ordering::SeqCst);
        Arc::new(t)
    }

    fn sent(&self) -> Vec<ChangeSet> {
        self.sent.lock().unwrap().clone()
    }

    fn queue_log(&self, log: ChangeLog) {
        self.queued.lock().unwrap().push(log);
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Transport for FakeTransport {
    fn send_changes(&self, change_set: &ChangeSet) -> pocketsync::Result<UploadAck> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(pocketsync::Error::Transport("offline".into()));
        }
        self.sent.lock().unwrap().push(change_set.clone());
        Ok(UploadAck::default())
    }

    fn fetch_changes(
        &self,
        since: Option<Timestamp>,
        _limit: usize,
    ) -> pocketsync::Result<Vec<ChangeLog>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(pocketsync::Error::Transport("offline".into()));
        }
        let floor = since.unwrap_or(Timestamp::EPOCH);
        Ok(self
            .queued
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.processed_at > floor)
            .cloned()
            .collect())
    }
}

static DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn new_store(configure: impl FnOnce(&mut SyncOptions)) -> (PocketSync, Arc<FakeTransport>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = FakeTransport::new();
    let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_path = format!(
        "file:e2e-{}-{}?mode=memory&cache=shared",
        std::process::id(),
        n
    );
    let mut options = SyncOptions::new(db_path, "https://sync.example.com", "proj-1", "token");
    options.user_id = Some("user-1".into());
    options.debounce_interval = Duration::from_millis(30);
    options.notifier_debounce = Duration::from_millis(10);
    options.transport = Some(transport.clone());
    configure(&mut options);
    let store = PocketSync::initialize(
        options,
        "CREATE TABLE todos (name TEXT, done INTEGER DEFAULT 0);",
    )
    .unwrap();
    (store, transport)
}

fn todo(name: &str) -> Map<String, JsonValue> {
    let mut values = Map::new();
    values.insert("name".into(), json!(name));
    values
}

fn todo_with_gid(name: &str, gid: &str) -> Map<String, JsonValue> {
    let mut values = todo(name);
    values.insert("ps_global_id".into(), json!(gid));
    values
}

fn remote_log(id: &str, processed_at: u64, change_set: ChangeSet) -> ChangeLog {
    ChangeLog {
        id: id.into(),
        device_id: "other-device".into(),
        received_at: Timestamp(processed_at),
        processed_at: Timestamp(processed_at),
        user_identifier: "user-1".into(),
        change_set,
    }
}

fn update_row(table: &str, gid: &str, data: Map<String, JsonValue>, ts: u64) -> ChangeSet {
    let mut change_set = ChangeSet::new(Timestamp(ts));
    change_set.updates.insert(
        table.into(),
        vec![WireRow {
            primary_key: gid.into(),
            data,
            timestamp: Timestamp(ts),
            version: 1,
        }],
    );
    change_set
}

fn delete_row(table: &str, gid: &str, ts: u64) -> ChangeSet {
    let mut change_set = ChangeSet::new(Timestamp(ts));
    change_set.deletions.insert(
        table.into(),
        vec![WireRow {
            primary_key: gid.into(),
            data: Map::new(),
            timestamp: Timestamp(ts),
            version: 1,
        }],
    );
    change_set
}

/// Poll until `check` passes or a couple of seconds elapse.
fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(15));
    }
    false
}

fn name_of(store: &PocketSync, gid: &str) -> Option<String> {
    let rows = store
        .query(
            "SELECT name FROM todos WHERE ps_global_id = ?",
            &[rusqlite::types::Value::Text(gid.into())],
        )
        .unwrap();
    rows.first()
        .and_then(|r| r["name"].as_str().map(str::to_owned))
}

// S1: offline inserts ship as one batch once connectivity returns.
#[test]
fn test_offline_then_online_uploads_once() {
    let (store, transport) = new_store(|_| {});
    store.start();
    store.set_connected(false);

    store.insert("todos", &todo("one")).unwrap();
    store.insert("todos", &todo("two")).unwrap();
    store.insert("todos", &todo("three")).unwrap();

    // Give the debounce every chance to (wrongly) fire while offline.
    std::thread::sleep(Duration::from_millis(200));
    assert!(transport.sent().is_empty());
    assert_eq!(store.pending_changes_count().unwrap(), 3);

    store.set_connected(true);
    assert!(wait_until(|| store.pending_changes_count().unwrap() == 0));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1, "exactly one upload fires");
    assert_eq!(sent[0].insertions["todos"].len(), 3);

    // The watermark equals the newest captured timestamp.
    let max_ts = store
        .query("SELECT MAX(timestamp) AS ts FROM __pocketsync_changes", &[])
        .unwrap()[0]["ts"]
        .as_i64()
        .unwrap();
    let state = store.device_state().unwrap().unwrap();
    assert_eq!(state.last_upload_timestamp, Some(Timestamp(max_ts as u64)));
    assert_eq!(state.last_sync_status.as_deref(), Some("success"));
    store.dispose();
}

// S2: a newer remote update wins and leaves no new change-log entries.
#[test]
fn test_remote_update_last_write_wins() {
    let (store, transport) = new_store(|_| {});
    store.insert("todos", &todo_with_gid("A", "r1")).unwrap();
    store
        .execute("UPDATE __pocketsync_changes SET timestamp = 100", &[])
        .unwrap();
    let total_changes_before = store
        .query("SELECT COUNT(*) AS n FROM __pocketsync_changes", &[])
        .unwrap()[0]["n"]
        .as_i64()
        .unwrap();

    transport.queue_log(remote_log(
        "c1",
        150,
        update_row("todos", "r1", todo("B"), 200),
    ));
    store.start();
    assert!(wait_until(|| name_of(&store, "r1").as_deref() == Some("B")));

    // Property 2: applying remote changes captured nothing.
    let total_changes_after = store
        .query("SELECT COUNT(*) AS n FROM __pocketsync_changes", &[])
        .unwrap()[0]["n"]
        .as_i64()
        .unwrap();
    assert_eq!(total_changes_before, total_changes_after);
    let state = store.device_state().unwrap().unwrap();
    assert_eq!(state.last_download_timestamp, Some(Timestamp(150)));
    store.dispose();
}

// S3: a stale remote update is discarded.
#[test]
fn test_stale_remote_update_is_discarded() {
    let (store, transport) = new_store(|_| {});
    store.insert("todos", &todo_with_gid("A", "r1")).unwrap();
    store
        .execute("UPDATE __pocketsync_changes SET timestamp = 200", &[])
        .unwrap();

    transport.queue_log(remote_log(
        "c1",
        300,
        update_row("todos", "r1", todo("B"), 100),
    ));
    store.start();
    assert!(wait_until(|| {
        store.device_state().unwrap().unwrap().last_download_timestamp == Some(Timestamp(300))
    }));
    assert_eq!(name_of(&store, "r1").as_deref(), Some("A"));
    store.dispose();
}

// S4: replaying the same change log is a no-op.
#[test]
fn test_replay_idempotence() {
    let (store, transport) = new_store(|_| {});
    store.insert("todos", &todo_with_gid("A", "r1")).unwrap();
    store
        .execute("UPDATE __pocketsync_changes SET timestamp = 100", &[])
        .unwrap();

    let log = remote_log("c1", 150, update_row("todos", "r1", todo("B"), 200));
    transport.queue_log(log.clone());
    transport.queue_log(log);

    store.start();
    assert!(wait_until(|| name_of(&store, "r1").as_deref() == Some("B")));

    let processed = store
        .query(
            "SELECT COUNT(*) AS n FROM __pocketsync_processed_changes WHERE change_log_id = 'c1'",
            &[],
        )
        .unwrap()[0]["n"]
        .as_i64()
        .unwrap();
    assert_eq!(processed, 1);
    store.dispose();
}

// S5: watchers re-emit after a local insert.
#[test]
fn test_watcher_reactivity() {
    let (store, _transport) = new_store(|_| {});
    let handle = store.watch("SELECT name FROM todos", vec![]).unwrap();
    match handle.receiver().recv_timeout(Duration::from_secs(2)) {
        Ok(pocketsync::WatchEvent::Rows(rows)) => assert!(rows.is_empty()),
        other => panic!("expected initial empty rows, got {:?}", other),
    }

    store.insert("todos", &todo("fresh")).unwrap();
    match handle.receiver().recv_timeout(Duration::from_secs(2)) {
        Ok(pocketsync::WatchEvent::Rows(rows)) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["name"], "fresh");
        }
        other => panic!("expected updated rows, got {:?}", other),
    }
    store.dispose();
}

// Watchers also observe remote changes once they're merged.
#[test]
fn test_watcher_sees_downloaded_changes() {
    let (store, transport) = new_store(|_| {});
    let handle = store.watch("SELECT name FROM todos", vec![]).unwrap();
    let _ = handle.receiver().recv_timeout(Duration::from_secs(2)).unwrap();

    transport.queue_log(remote_log(
        "c1",
        100,
        update_row("todos", "remote-row", todo("from afar"), 100),
    ));
    store.start();

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut saw_remote_row = false;
    while Instant::now() < deadline && !saw_remote_row {
        if let Ok(pocketsync::WatchEvent::Rows(rows)) =
            handle.receiver().recv_timeout(Duration::from_millis(200))
        {
            saw_remote_row = rows.iter().any(|r| r["name"] == "from afar");
        }
    }
    assert!(saw_remote_row);
    store.dispose();
}

// S6: the queue hard cap drops the oldest changes, which then never upload.
#[test]
fn test_queue_cap_enforced() {
    let (store, transport) = new_store(|options| {
        options.queue_hard_cap = 100;
    });
    store.set_connected(false);
    store.start();

    for i in 0..150 {
        store
            .insert("todos", &todo(&format!("todo-{}", i)))
            .unwrap();
    }
    // Spread the timestamps so "oldest" is well-defined.
    store
        .execute(
            "UPDATE __pocketsync_changes SET timestamp = timestamp + id",
            &[],
        )
        .unwrap();
    assert_eq!(store.pending_changes_count().unwrap(), 150);

    let stats = store.prune_now().unwrap();
    assert_eq!(stats.dropped_overflow, 50);
    assert_eq!(store.pending_changes_count().unwrap(), 100);

    store.set_connected(true);
    assert!(wait_until(|| store.pending_changes_count().unwrap() == 0));
    let sent = transport.sent();
    let uploaded: usize = sent.iter().map(|cs| cs.change_count()).sum();
    assert_eq!(uploaded, 100, "the 50 dropped changes never upload");
    store.dispose();
}

// A remote tombstone deletes the local row.
#[test]
fn test_remote_tombstone_deletes() {
    let (store, transport) = new_store(|_| {});
    store.insert("todos", &todo_with_gid("A", "r1")).unwrap();
    store
        .execute("UPDATE __pocketsync_changes SET timestamp = 100", &[])
        .unwrap();

    transport.queue_log(remote_log("c1", 400, delete_row("todos", "r1", 300)));
    store.start();
    assert!(wait_until(|| name_of(&store, "r1").is_none()));
    store.dispose();
}

// Auth failures pause the scheduler instead of retrying.
#[test]
fn test_auth_error_pauses_sync() {
    struct AuthFailTransport;
    impl Transport for AuthFailTransport {
        fn send_changes(&self, _: &ChangeSet) -> pocketsync::Result<UploadAck> {
            Err(pocketsync::Error::Auth { status: 401 })
        }
        fn fetch_changes(
            &self,
            _: Option<Timestamp>,
            _: usize,
        ) -> pocketsync::Result<Vec<ChangeLog>> {
            Ok(vec![])
        }
    }

    let transport = Arc::new(AuthFailTransport);
    let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut options = SyncOptions::new(
        format!("file:e2e-auth-{}-{}?mode=memory&cache=shared", std::process::id(), n),
        "https://sync.example.com",
        "proj-1",
        "token",
    );
    options.user_id = Some("user-1".into());
    options.debounce_interval = Duration::from_millis(20);
    options.notifier_debounce = Duration::from_millis(5);
    options.transport = Some(transport);
    let store =
        PocketSync::initialize(options, "CREATE TABLE todos (name TEXT);").unwrap();
    store.start();
    store.insert("todos", &todo("doomed")).unwrap();

    assert!(wait_until(|| {
        store.sync_status().unwrap().as_deref() == Some("failure: auth")
    }));
    // The change is still queued for whenever credentials are fixed.
    assert_eq!(store.pending_changes_count().unwrap(), 1);
    store.dispose();
}

// reset() requeues everything as fresh inserts.
#[test]
fn test_reset_requeues_rows() {
    let (store, transport) = new_store(|_| {});
    store.start();
    store.insert("todos", &todo_with_gid("keep me", "r1")).unwrap();
    assert!(wait_until(|| store.pending_changes_count().unwrap() == 0));
    assert_eq!(transport.sent().len(), 1);

    store.reset().unwrap();
    assert_eq!(store.pending_changes_count().unwrap(), 1);
    assert!(wait_until(|| store.pending_changes_count().unwrap() == 0));
    // The re-seeded insert uploads with the same global id.
    let sent = transport.sent();
    assert_eq!(sent.last().unwrap().insertions["todos"][0].primary_key, "r1");
    store.dispose();
}

// Batched writes in one transaction coalesce to a single upload.
#[test]
fn test_transaction_batches_upload_together() {
    let (store, transport) = new_store(|_| {});
    store.start();
    store
        .run_in_transaction(|conn| {
            for i in 0..5 {
                conn.execute(
                    "INSERT INTO todos (name) VALUES (?)",
                    [format!("tx-{}", i)],
                )?;
            }
            Ok(())
        })
        .unwrap();

    assert!(wait_until(|| store.pending_changes_count().unwrap() == 0));
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].insertions["todos"].len(), 5);
    store.dispose();
}
