/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The sync scheduler: one worker thread per direction (upload, download),
// each a single-flight queue with debounce, retry with jittered exponential
// backoff, a circuit breaker, and a connectivity gate.  Triggers arriving
// while a task runs coalesce into at most one follow-up run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::*;

/// A direction's work.  Returns whether anything was actually done; errors
/// drive the retry/breaker logic.
pub type SyncTask = Box<dyn Fn() -> Result<bool> + Send>;

#[derive(Clone)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub breaker_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            breaker_threshold: 5,
            backoff_initial: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

enum Msg {
    Trigger { immediate: bool },
    Connectivity(bool),
    Start,
    Stop,
    Shutdown,
}

struct Worker {
    tx: Sender<Msg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    fn spawn(
        name: &'static str,
        config: SchedulerConfig,
        running: Arc<AtomicBool>,
        connected: Arc<AtomicBool>,
        task: SyncTask,
    ) -> Self {
        let (tx, rx) = unbounded::<Msg>();
        let handle = thread::Builder::new()
            .name(format!("pocketsync-{}", name))
            .spawn(move || {
                let mut pending = false;
                let mut deadline: Option<Instant> = None;
                let mut failures: u32 = 0;
                let mut breaker_open = false;
                loop {
                    let msg = match deadline {
                        Some(d) => match rx.recv_deadline(d) {
                            Ok(msg) => Some(msg),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(msg) => Some(msg),
                            Err(_) => break,
                        },
                    };
                    match msg {
                        Some(Msg::Trigger { immediate }) => {
                            if !running.load(Ordering::SeqCst) {
                                // stop() discards work; nothing queues while
                                // stopped.
                                continue;
                            }
                            if breaker_open {
                                log::trace!("{}: breaker open, ignoring trigger", name);
                                continue;
                            }
                            pending = true;
                            let proposed = if immediate {
                                Instant::now()
                            } else {
                                Instant::now() + config.debounce
                            };
                            // Coalesce: never push an existing deadline
                            // further out.
                            deadline = Some(match deadline {
                                Some(d) => d.min(proposed),
                                None => proposed,
                            });
                        }
                        Some(Msg::Connectivity(online)) => {
                            if online {
                                // Fresh start: the breaker resets and both
                                // directions run once.
                                failures = 0;
                                breaker_open = false;
                                if running.load(Ordering::SeqCst) {
                                    pending = true;
                                    deadline = Some(Instant::now());
                                }
                            } else {
                                // Hold queued work; retries pause.
                                deadline = None;
                            }
                        }
                        Some(Msg::Start) => {
                            failures = 0;
                            breaker_open = false;
                            if pending {
                                deadline = Some(Instant::now() + config.debounce);
                            }
                        }
                        Some(Msg::Stop) => {
                            pending = false;
                            deadline = None;
                            failures = 0;
                        }
                        Some(Msg::Shutdown) => break,
                        None => {
                            // Deadline expired - time to work.
                            deadline = None;
                            if !running.load(Ordering::SeqCst) {
                                pending = false;
                                continue;
                            }
                            if !connected.load(Ordering::SeqCst) {
                                // Stay pending; Connectivity(true) reschedules.
                                continue;
                            }
                            pending = false;
                            match task() {
                                Ok(did_work) => {
                                    failures = 0;
                                    if did_work {
                                        log::debug!("{}: pass complete", name);
                                    }
                                }
                                Err(e) if e.is_auth() => {
                                    log::error!("{}: {}; pausing sync until start()", name, e);
                                    running.store(false, Ordering::SeqCst);
                                }
                                Err(e) if e.is_transient() => {
                                    failures += 1;
                                    if failures >= config.breaker_threshold {
                                        breaker_open = true;
                                        log::error!(
                                            "{}: {} consecutive failures; circuit breaker open",
                                            name,
                                            failures
                                        );
                                    } else {
                                        let delay = backoff_delay(&config, failures);
                                        log::warn!(
                                            "{}: {}; retrying in {:?}",
                                            name,
                                            e,
                                            delay
                                        );
                                        pending = true;
                                        deadline = Some(Instant::now() + delay);
                                    }
                                }
                                Err(e) => {
                                    // Storage-ish errors aren't fixed by
                                    // retrying; the change log keeps the data
                                    // safe for the next trigger.
                                    log::error!("{}: task failed: {}", name, e);
                                }
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn scheduler worker");
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn send(&self, msg: Msg) {
        let _ = self.tx.send(msg);
    }

    fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Exponential backoff with +/-20% jitter: 500ms, 1s, 2s ... capped at 30s.
fn backoff_delay(config: &SchedulerConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let base = config
        .backoff_initial
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.backoff_cap);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    base.mul_f64(jitter)
}

pub struct SyncScheduler {
    upload: Worker,
    download: Worker,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Workers spawn immediately but stay paused until `start()`.
    pub fn new(config: SchedulerConfig, upload_task: SyncTask, download_task: SyncTask) -> Self {
        let running = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));
        let upload = Worker::spawn(
            "upload",
            config.clone(),
            Arc::clone(&running),
            Arc::clone(&connected),
            upload_task,
        );
        let download = Worker::spawn(
            "download",
            config,
            Arc::clone(&running),
            Arc::clone(&connected),
            download_task,
        );
        Self {
            upload,
            download,
            running,
            connected,
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.upload.send(Msg::Start);
        self.download.send(Msg::Start);
    }

    /// Drain-and-halt: the in-flight task (if any) finishes, queued work is
    /// discarded, timers are cancelled.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.upload.send(Msg::Stop);
        self.download.send(Msg::Stop);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn trigger_upload(&self) {
        self.upload.send(Msg::Trigger { immediate: false });
    }

    pub fn trigger_download(&self) {
        self.download.send(Msg::Trigger { immediate: false });
    }

    /// Force an immediate upload+download pass, skipping the debounce.
    pub fn sync_now(&self) {
        self.upload.send(Msg::Trigger { immediate: true });
        self.download.send(Msg::Trigger { immediate: true });
    }

    pub fn set_connected(&self, online: bool) {
        let was = self.connected.swap(online, Ordering::SeqCst);
        if was != online {
            log::info!("connectivity changed: online={}", online);
        }
        self.upload.send(Msg::Connectivity(online));
        self.download.send(Msg::Connectivity(online));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.stop();
        self.upload.shutdown();
        self.download.shutdown();
    }
}
