/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The public face: an explicit handle owning the connections, the
// notifier, the watcher registry, the scheduler and the transport.  Hosts
// mutate through the pass-throughs here so capture and notification always
// happen; everything else is wiring.

use std::sync::Arc;

use interrupt_support::InterruptHandle;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{Map, Value as JsonValue};
use types::Timestamp;

use crate::config::SyncOptions;
use crate::conflict::ConflictResolver;
use crate::db::{json_to_sql, row_to_json_object, ConnectionType, SyncConnection};
use crate::error::*;
use crate::notifier::{ChangeNotifier, NotifierSink, TableChange};
use crate::scheduler::{SchedulerConfig, SyncScheduler, SyncTask};
use crate::schema::{self, quote_ident};
use crate::storage::changes::{self, Operation};
use crate::storage::device;
use crate::sync::{incoming, outgoing, RowLocks};
use crate::transport::events::EventChannel;
use crate::transport::http::HttpTransport;
use crate::transport::{RequestContext, Transport};
use crate::watcher::{WatchHandle, WatcherRegistry, WatcherSink};

/// How often the change log is pruned, at most.
const CLEANUP_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

struct SchedulerSink(Arc<SyncScheduler>);

impl NotifierSink for SchedulerSink {
    fn tables_changed(&self, changes: &[TableChange]) {
        // Only local writes schedule an upload; remote applies must not
        // echo back to the server.
        if changes.iter().any(|c| c.has_local) {
            self.0.trigger_upload();
        }
    }
}

pub struct PocketSync {
    options: SyncOptions,
    writer: Arc<SyncConnection>,
    #[allow(dead_code)] // held for its connection lifetime; used via tasks
    syncer: Arc<SyncConnection>,
    watchers: Arc<WatcherRegistry>,
    notifier: Arc<ChangeNotifier>,
    scheduler: Arc<SyncScheduler>,
    events: Option<EventChannel>,
    ctx: Arc<RequestContext>,
    interrupt: InterruptHandle,
}

impl PocketSync {
    /// Open the database, run the host's DDL, augment every table with
    /// change capture, and wire up the sync machinery.  Nothing talks to
    /// the network until `start()`.
    pub fn initialize(options: SyncOptions, schema_ddl: &str) -> Result<PocketSync> {
        let writer = Arc::new(SyncConnection::open(
            &options.db_path,
            ConnectionType::ReadWrite,
        )?);
        let device_id = {
            let conn = writer.lock();
            if !schema_ddl.is_empty() {
                conn.execute_batch(schema_ddl)
                    .map_err(|e| Error::Schema(format!("host schema failed: {}", e)))?;
            }
            let tables = schema::augment_user_tables(&conn)?;
            log::info!("tracking {} table(s)", tables.len());
            device::ensure(&conn, options.device_fingerprint.as_deref())?.device_id
        };
        let syncer = Arc::new(SyncConnection::open(&options.db_path, ConnectionType::Sync)?);

        let ctx = Arc::new(RequestContext::new(
            options.project_id.clone(),
            options.auth_token.clone(),
            device_id.clone(),
            options.user_id.clone(),
        ));
        let transport: Arc<dyn Transport> = match &options.transport {
            Some(custom) => Arc::clone(custom),
            None => Arc::new(HttpTransport::new(
                &options.server_url,
                options.request_timeout,
                Arc::clone(&ctx),
            )?),
        };
        let resolver = Arc::new(ConflictResolver::new(
            options.conflict_strategy,
            options.custom_resolver.clone(),
        )?);
        let row_locks = Arc::new(RowLocks::new());
        let watchers = WatcherRegistry::new(Arc::clone(&writer));
        let interrupt = InterruptHandle::new();

        let notifier_slot = Arc::new(once_cell::sync::OnceCell::new());
        let scheduler = Arc::new(SyncScheduler::new(
            SchedulerConfig {
                debounce: options.debounce_interval,
                breaker_threshold: options.breaker_threshold,
                ..SchedulerConfig::default()
            },
            upload_task(&options, &writer, &transport, &row_locks, &ctx),
            download_task(
                &options, &syncer, &transport, &resolver, &row_locks, &ctx, &device_id,
                &interrupt, &notifier_slot,
            ),
        ));

        // Fan-out order: watchers first (they're cheap), then the upload
        // trigger.
        let notifier = Arc::new(ChangeNotifier::start(
            options.notifier_debounce,
            vec![
                Box::new(WatcherSink(Arc::clone(&watchers))),
                Box::new(SchedulerSink(Arc::clone(&scheduler))),
            ],
        ));
        let _ = notifier_slot.set(Arc::clone(&notifier));

        // No event channel when the host injected its own transport - the
        // fake has no stream to speak of.
        let events = if options.transport.is_none() {
            let scheduler_for_events = Arc::clone(&scheduler);
            Some(EventChannel::start(
                &options.server_url,
                Arc::clone(&ctx),
                options.event_reconnect_cap,
                Box::new(move |_notification| scheduler_for_events.trigger_download()),
            )?)
        } else {
            None
        };

        if options.verbose {
            log::info!(
                "pocketsync initialized: device {} project {}",
                device_id,
                options.project_id
            );
        }
        Ok(PocketSync {
            options,
            writer,
            syncer,
            watchers,
            notifier,
            scheduler,
            events,
            ctx,
            interrupt,
        })
    }

    /// Begin (or resume) syncing and kick a catch-up pass in each
    /// direction.
    pub fn start(&self) {
        self.interrupt.clear();
        self.scheduler.start();
        self.scheduler.trigger_upload();
        self.scheduler.trigger_download();
    }

    /// Drain-and-halt both directions; local capture keeps running.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Stop everything and close the event channel and watcher streams.
    /// The handle is inert afterwards.
    pub fn dispose(&self) {
        self.interrupt.interrupt();
        self.scheduler.shutdown();
        self.notifier.shutdown();
        if let Some(events) = &self.events {
            events.shutdown();
        }
        self.watchers.clear();
    }

    /// Drop all change tracking and re-seed as if freshly installed.
    /// Destructive: every local row is queued for upload again.
    pub fn reset(&self) -> Result<()> {
        let before = {
            let conn = self.writer.lock();
            let before = changes::max_change_id(&conn)?;
            schema::reset(&conn)?;
            before
        };
        self.notify_from_change_log(before)?;
        Ok(())
    }

    pub fn set_user_id(&self, user_id: &str) {
        self.ctx.set_user_id(user_id.to_owned());
        self.scheduler.sync_now();
    }

    /// Force an immediate upload+download pass.
    pub fn schedule_sync(&self) {
        self.scheduler.sync_now();
    }

    /// Host-provided reachability signal.
    pub fn set_connected(&self, online: bool) {
        self.scheduler.set_connected(online);
    }

    pub fn device_id(&self) -> String {
        self.ctx.device_id.clone()
    }

    pub fn sync_status(&self) -> Result<Option<String>> {
        let conn = self.writer.lock();
        Ok(device::get(&conn)?.and_then(|s| s.last_sync_status))
    }

    pub fn device_state(&self) -> Result<Option<device::DeviceState>> {
        device::get(&self.writer.lock())
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn pending_changes_count(&self) -> Result<i64> {
        changes::pending_count(&self.writer.lock())
    }

    pub fn oldest_pending_timestamp(&self) -> Result<Option<Timestamp>> {
        changes::oldest_pending_timestamp(&self.writer.lock())
    }

    /// Enforce the queue cap and retention window right now, regardless of
    /// the daily cleanup cadence.
    pub fn prune_now(&self) -> Result<changes::PruneStats> {
        let conn = self.writer.lock();
        let now = Timestamp::now();
        let cutoff = now
            .checked_sub(self.options.retention_window)
            .unwrap_or(Timestamp::EPOCH);
        let stats = changes::prune(&conn, self.options.queue_hard_cap, cutoff, &[])?;
        device::set_last_cleanup(&conn, now)?;
        Ok(stats)
    }

    // === Mutating pass-throughs ===
    //
    // Each one runs on the writer connection (so the triggers capture it)
    // and then notifies the change notifier with the affected table.

    pub fn insert(&self, table: &str, values: &Map<String, JsonValue>) -> Result<i64> {
        let rowid = {
            let conn = self.writer.lock();
            let columns: Vec<&String> = values.keys().collect();
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
                placeholders.join(", ")
            );
            let params: Vec<SqlValue> =
                columns.iter().map(|c| json_to_sql(&values[c.as_str()])).collect();
            conn.execute(&sql, rusqlite::params_from_iter(params))?;
            conn.last_insert_rowid()
        };
        self.notifier.notify(table, Operation::Insert, false);
        Ok(rowid)
    }

    pub fn update(
        &self,
        table: &str,
        values: &Map<String, JsonValue>,
        where_clause: &str,
        where_params: &[SqlValue],
    ) -> Result<usize> {
        let changed = {
            let conn = self.writer.lock();
            let columns: Vec<&String> = values.keys().collect();
            let assignments: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(table),
                assignments.join(", "),
                where_clause
            );
            let mut params: Vec<SqlValue> =
                columns.iter().map(|c| json_to_sql(&values[c.as_str()])).collect();
            params.extend(where_params.iter().cloned());
            conn.execute(&sql, rusqlite::params_from_iter(params))?
        };
        self.notifier.notify(table, Operation::Update, false);
        Ok(changed)
    }

    pub fn delete(
        &self,
        table: &str,
        where_clause: &str,
        where_params: &[SqlValue],
    ) -> Result<usize> {
        let deleted = {
            let conn = self.writer.lock();
            let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), where_clause);
            conn.execute(&sql, rusqlite::params_from_iter(where_params.iter().cloned()))?
        };
        self.notifier.notify(table, Operation::Delete, false);
        Ok(deleted)
    }

    /// Raw statement pass-through.  Affected tables are reconstructed from
    /// what the capture triggers logged, so notification stays accurate
    /// even for SQL we can't predict.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let (changed, before) = {
            let conn = self.writer.lock();
            let before = changes::max_change_id(&conn)?;
            let changed = conn.execute(sql, rusqlite::params_from_iter(params.iter().cloned()))?;
            (changed, before)
        };
        self.notify_from_change_log(before)?;
        Ok(changed)
    }

    /// Run `f` inside a transaction on the writer connection.  Writes made
    /// through the connection are captured by the triggers as usual;
    /// notifications are derived from the change log after commit.
    pub fn run_in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        use sql_support::ConnExt;
        let (result, before) = {
            let conn = self.writer.lock();
            let before = changes::max_change_id(&conn)?;
            let tx = conn.unchecked_transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            (result, before)
        };
        self.notify_from_change_log(before)?;
        Ok(result)
    }

    /// Read-only query; each row comes back as a JSON object.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<JsonValue>> {
        let conn = self.writer.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_and_then(
            rusqlite::params_from_iter(params.iter().cloned()),
            |row| -> Result<JsonValue> { Ok(JsonValue::Object(row_to_json_object(row)?)) },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Register a live query.  The stream re-emits whenever one of the
    /// statement's tables changes, locally or via sync.
    pub fn watch(&self, sql: &str, params: Vec<SqlValue>) -> Result<WatchHandle> {
        self.watchers.watch(sql, params)
    }

    fn notify_from_change_log(&self, since_id: i64) -> Result<()> {
        let changed = {
            let conn = self.writer.lock();
            changes::changes_since(&conn, since_id)?
        };
        for (table, operation) in changed {
            self.notifier.notify(&table, operation, false);
        }
        Ok(())
    }

}

fn upload_task(
    options: &SyncOptions,
    writer: &Arc<SyncConnection>,
    transport: &Arc<dyn Transport>,
    row_locks: &Arc<RowLocks>,
    ctx: &Arc<RequestContext>,
) -> SyncTask {
    let writer = Arc::clone(writer);
    let transport = Arc::clone(transport);
    let row_locks = Arc::clone(row_locks);
    let ctx = Arc::clone(ctx);
    let max_batch_size = options.max_batch_size;
    let queue_hard_cap = options.queue_hard_cap;
    let retention_window = options.retention_window;
    Box::new(move || {
        if ctx.user_id().is_none() {
            log::debug!("no user id yet; holding uploads");
            return Ok(false);
        }
        let batch = {
            let conn = writer.lock();
            outgoing::collect_outgoing(&conn, &row_locks, max_batch_size)?
        };
        let Some(batch) = batch else {
            return Ok(false);
        };
        // The connection lock is released during the network call.
        let sent = transport.send_changes(&batch.change_set);
        let conn = writer.lock();
        match sent {
            Ok(_ack) => {
                outgoing::record_uploaded(&conn, &batch)?;
                device::set_sync_status(&conn, "success")?;
                maybe_prune(&conn, queue_hard_cap, retention_window, &batch.ids)?;
                Ok(true)
            }
            Err(e) => {
                // Rows stay unsynced; the scheduler owns the retry.
                let _ = device::set_sync_status(&conn, &format!("failure: {}", e.status_label()));
                Err(e)
            }
        }
    })
}

fn maybe_prune(
    conn: &Connection,
    queue_hard_cap: usize,
    retention_window: std::time::Duration,
    in_flight: &[i64],
) -> Result<()> {
    let now = Timestamp::now();
    let state = device::get(conn)?;
    let due = match state.and_then(|s| s.last_cleanup_timestamp) {
        Some(last) => now.as_millis().saturating_sub(last.as_millis()) >= CLEANUP_INTERVAL_MS,
        None => true,
    };
    if !due {
        return Ok(());
    }
    let cutoff = now
        .checked_sub(retention_window)
        .unwrap_or(Timestamp::EPOCH);
    let stats = changes::prune(conn, queue_hard_cap, cutoff, in_flight)?;
    device::set_last_cleanup(conn, now)?;
    log::debug!(
        "pruned change log: {} overflow, {} expired",
        stats.dropped_overflow,
        stats.dropped_expired
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn download_task(
    options: &SyncOptions,
    syncer: &Arc<SyncConnection>,
    transport: &Arc<dyn Transport>,
    resolver: &Arc<ConflictResolver>,
    row_locks: &Arc<RowLocks>,
    ctx: &Arc<RequestContext>,
    device_id: &str,
    interrupt: &InterruptHandle,
    // The notifier is built after the scheduler (it fans out *to* the
    // scheduler), so the task reaches it through a slot filled in during
    // wiring.
    notifier_slot: &Arc<once_cell::sync::OnceCell<Arc<ChangeNotifier>>>,
) -> SyncTask {
    let syncer = Arc::clone(syncer);
    let transport = Arc::clone(transport);
    let resolver = Arc::clone(resolver);
    let row_locks = Arc::clone(row_locks);
    let ctx = Arc::clone(ctx);
    let device_id = device_id.to_owned();
    let interrupt = interrupt.clone();
    let max_batch_size = options.max_batch_size;
    let notifier_slot = Arc::clone(notifier_slot);
    Box::new(move || {
        if ctx.user_id().is_none() {
            log::debug!("no user id yet; holding downloads");
            return Ok(false);
        }
        let since = {
            let conn = syncer.lock();
            device::get(&conn)?.and_then(|s| s.last_download_timestamp)
        };
        let logs = transport.fetch_changes(since, max_batch_size)?;
        if logs.is_empty() {
            return Ok(false);
        }
        log::debug!("fetched {} change log(s) since {:?}", logs.len(), since);
        let stats = incoming::apply_change_logs(
            &syncer, &resolver, &row_locks, &device_id, &logs, &interrupt,
        )?;
        {
            let conn = syncer.lock();
            if let Some(ts) = stats.max_timestamp {
                device::set_last_download(&conn, ts)?;
            }
            let status = if stats.unresolved.is_some() {
                "failure: conflict"
            } else {
                "success"
            };
            device::set_sync_status(&conn, status)?;
        }
        if let Some(notifier) = notifier_slot.get() {
            for (table, operation) in &stats.changed_tables {
                notifier.notify(table, *operation, true);
            }
        }
        Ok(stats.applied_logs > 0)
    })
}
