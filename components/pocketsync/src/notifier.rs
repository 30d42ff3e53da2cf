/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Table-change fan-out.  Mutations are reported here as they happen; a
// dedicated thread coalesces bursts (batched writes produce one
// notification per table, not one per row) and then hands the batch to the
// registered sinks - the watcher registry and the scheduler.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::storage::changes::Operation;

/// A coalesced notification for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    /// Lowercased table name.
    pub table: String,
    /// Which operations were seen within the window, deduplicated.
    pub operations: Vec<Operation>,
    /// Whether any of the coalesced notifications came from a local write.
    /// The scheduler only reacts to these - remote applies must not
    /// trigger a re-upload.
    pub has_local: bool,
    pub has_remote: bool,
}

pub trait NotifierSink: Send + Sync {
    fn tables_changed(&self, changes: &[TableChange]);
}

enum Msg {
    Notify {
        table: String,
        operation: Operation,
        remote: bool,
    },
    Flush(Sender<()>),
    Shutdown,
}

pub struct ChangeNotifier {
    tx: Sender<Msg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChangeNotifier {
    pub fn start(window: Duration, sinks: Vec<Box<dyn NotifierSink>>) -> Self {
        let (tx, rx) = unbounded::<Msg>();
        let handle = thread::Builder::new()
            .name("pocketsync-notifier".into())
            .spawn(move || {
                let mut pending: BTreeMap<String, TableChange> = BTreeMap::new();
                let mut deadline: Option<Instant> = None;
                loop {
                    let msg = match deadline {
                        None => match rx.recv() {
                            Ok(msg) => msg,
                            Err(_) => break,
                        },
                        Some(d) => match rx.recv_deadline(d) {
                            Ok(msg) => msg,
                            Err(RecvTimeoutError::Timeout) => {
                                emit(&mut pending, &sinks);
                                deadline = None;
                                continue;
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                    };
                    match msg {
                        Msg::Notify {
                            table,
                            operation,
                            remote,
                        } => {
                            let entry =
                                pending.entry(table.clone()).or_insert_with(|| TableChange {
                                    table,
                                    operations: Vec::new(),
                                    has_local: false,
                                    has_remote: false,
                                });
                            if !entry.operations.contains(&operation) {
                                entry.operations.push(operation);
                            }
                            if remote {
                                entry.has_remote = true;
                            } else {
                                entry.has_local = true;
                            }
                            if deadline.is_none() {
                                deadline = Some(Instant::now() + window);
                            }
                        }
                        Msg::Flush(ack) => {
                            emit(&mut pending, &sinks);
                            deadline = None;
                            let _ = ack.send(());
                        }
                        Msg::Shutdown => {
                            emit(&mut pending, &sinks);
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn notifier thread");
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn notify(&self, table: &str, operation: Operation, remote: bool) {
        let _ = self.tx.send(Msg::Notify {
            table: table.to_lowercase(),
            operation,
            remote,
        });
    }

    /// Force pending notifications out now and wait until they're
    /// delivered.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = unbounded();
        if self.tx.send(Msg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn emit(pending: &mut BTreeMap<String, TableChange>, sinks: &[Box<dyn NotifierSink>]) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<TableChange> = std::mem::take(pending).into_values().collect();
    log::trace!("notifying {} changed table(s)", batch.len());
    for sink in sinks {
        sink.tables_changed(&batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Recorder(Arc<Mutex<Vec<Vec<TableChange>>>>);

    impl NotifierSink for Recorder {
        fn tables_changed(&self, changes: &[TableChange]) {
            self.0.lock().push(changes.to_vec());
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<Vec<TableChange>>>>, Box<dyn NotifierSink>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (log.clone(), Box::new(Recorder(log)))
    }

    #[test]
    fn test_bursts_coalesce_per_table() {
        let (log, sink) = recorder();
        let notifier = ChangeNotifier::start(Duration::from_millis(20), vec![sink]);
        for _ in 0..10 {
            notifier.notify("todos", Operation::Insert, false);
        }
        notifier.notify("todos", Operation::Update, false);
        notifier.notify("lists", Operation::Delete, false);
        notifier.flush();

        let emissions = log.lock();
        assert_eq!(emissions.len(), 1);
        let batch = &emissions[0];
        assert_eq!(batch.len(), 2);
        let todos = batch.iter().find(|c| c.table == "todos").unwrap();
        assert_eq!(todos.operations, vec![Operation::Insert, Operation::Update]);
        assert!(todos.has_local);
        assert!(!todos.has_remote);
        notifier.shutdown();
    }

    #[test]
    fn test_debounce_window_emits_without_flush() {
        let (log, sink) = recorder();
        let notifier = ChangeNotifier::start(Duration::from_millis(10), vec![sink]);
        notifier.notify("todos", Operation::Insert, false);
        // Well past the window; the thread should have emitted on its own.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(log.lock().len(), 1);
        notifier.shutdown();
    }

    #[test]
    fn test_remote_flag_propagates() {
        let (log, sink) = recorder();
        let notifier = ChangeNotifier::start(Duration::from_millis(20), vec![sink]);
        notifier.notify("todos", Operation::Update, true);
        notifier.notify("todos", Operation::Update, false);
        notifier.flush();
        let emissions = log.lock();
        let todos = &emissions[0][0];
        assert!(todos.has_local);
        assert!(todos.has_remote);
        notifier.shutdown();
    }

    #[test]
    fn test_shutdown_flushes() {
        let (log, sink) = recorder();
        let notifier = ChangeNotifier::start(Duration::from_secs(60), vec![sink]);
        notifier.notify("todos", Operation::Insert, false);
        notifier.shutdown();
        assert_eq!(log.lock().len(), 1);
    }
}
