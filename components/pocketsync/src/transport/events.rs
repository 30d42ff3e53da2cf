/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The event channel: a long-lived GET /events stream over which the
// coordinator hints that another device uploaded.  Frames are
// line-oriented:
//
//     id: <cursor>
//     data: <json RemoteNotification>
//     <blank line dispatches the frame>
//
// Notifications only ever trigger a download - the data channel is the
// source of truth.  The reader runs one explicit state machine
// (disconnected -> connecting -> open -> draining) with reconnect backoff
// and a `Last-Event-ID` resume cursor.

use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::sync::record::RemoteNotification;
use crate::transport::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Draining,
}

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Accumulates lines into frames.  Pure, so the parsing is testable
/// without a socket.
#[derive(Default)]
pub struct FrameParser {
    cursor: Option<String>,
    pending_id: Option<String>,
    pending_data: Option<String>,
}

impl FrameParser {
    /// Feed one line; a completed frame yields its notification.
    pub fn feed(&mut self, line: &str) -> Option<RemoteNotification> {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(id) = line.strip_prefix("id:") {
            self.pending_id = Some(id.trim().to_owned());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.pending_data = Some(data.trim().to_owned());
        } else if line.starts_with(':') {
            // comment/keepalive line
        } else {
            log::trace!("ignoring unknown event line: {:?}", line);
        }
        None
    }

    /// Flush whatever is buffered, completed or not.  Used when the stream
    /// ends mid-frame.
    pub fn drain(&mut self) -> Option<RemoteNotification> {
        self.dispatch()
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    fn dispatch(&mut self) -> Option<RemoteNotification> {
        if let Some(id) = self.pending_id.take() {
            self.cursor = Some(id);
        }
        let data = self.pending_data.take()?;
        match serde_json::from_str::<RemoteNotification>(&data) {
            Ok(notification) => Some(notification),
            Err(e) => {
                log::warn!("discarding unparseable event frame: {}", e);
                None
            }
        }
    }
}

pub struct EventChannel {
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<ChannelState>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventChannel {
    /// Spawn the reader thread.  `on_notification` is invoked on that
    /// thread for every dispatched frame.
    pub fn start(
        server_url: &str,
        ctx: Arc<RequestContext>,
        reconnect_cap: u32,
        on_notification: Box<dyn Fn(RemoteNotification) + Send>,
    ) -> crate::error::Result<Self> {
        let events_url = url::Url::parse(server_url)?.join("events")?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(ChannelState::Disconnected));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("pocketsync-events".into())
            .spawn(move || {
                reader_loop(
                    events_url,
                    ctx,
                    reconnect_cap,
                    on_notification,
                    thread_shutdown,
                    thread_state,
                );
            })
            .expect("failed to spawn event channel thread");
        Ok(Self {
            shutdown,
            state,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Stop the reader.  A reader parked in a blocking read is left to die
    /// with the process rather than joined.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn reader_loop(
    events_url: url::Url,
    ctx: Arc<RequestContext>,
    reconnect_cap: u32,
    on_notification: Box<dyn Fn(RemoteNotification) + Send>,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<ChannelState>>,
) {
    // No overall timeout - this response is supposed to live forever.
    let client = match reqwest::blocking::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            log::error!("event channel could not build a client: {}", e);
            return;
        }
    };

    let mut parser = FrameParser::default();
    let mut consecutive_failures: u32 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        *state.lock() = ChannelState::Connecting;
        let mut request = client
            .get(events_url.clone())
            .header("X-Project-Id", &ctx.project_id)
            .header("Authorization", format!("Bearer {}", ctx.auth_token))
            .header("X-Device-Id", &ctx.device_id)
            .header("Accept", "text/event-stream");
        if let Some(user_id) = ctx.user_id() {
            request = request.header("X-User-Id", user_id);
        }
        if let Some(cursor) = parser.cursor() {
            request = request.header("Last-Event-ID", cursor.to_owned());
        }

        match request.send() {
            Ok(response) if response.status().is_success() => {
                log::debug!("event channel open");
                *state.lock() = ChannelState::Open;
                consecutive_failures = 0;
                read_stream(response, &mut parser, &on_notification, &shutdown);
                // Stream ended; flush any buffered frame before
                // reconnecting.
                *state.lock() = ChannelState::Draining;
                if let Some(notification) = parser.drain() {
                    on_notification(notification);
                }
                *state.lock() = ChannelState::Disconnected;
            }
            Ok(response) => {
                let status = response.status().as_u16();
                if status == 401 || status == 403 {
                    log::error!("event channel rejected with HTTP {}; giving up", status);
                    break;
                }
                log::warn!("event channel got HTTP {}", status);
                consecutive_failures += 1;
            }
            Err(e) => {
                log::warn!("event channel connect failed: {}", e);
                consecutive_failures += 1;
            }
        }

        if consecutive_failures > reconnect_cap {
            log::error!(
                "event channel failed {} consecutive reconnects; notifications disabled \
                 (the batch channel still works)",
                consecutive_failures
            );
            break;
        }
        interruptible_sleep(reconnect_delay(consecutive_failures), &shutdown);
    }
    *state.lock() = ChannelState::Disconnected;
}

fn read_stream(
    response: impl Read,
    parser: &mut FrameParser,
    on_notification: &dyn Fn(RemoteNotification),
    shutdown: &AtomicBool,
) {
    let reader = BufReader::new(response);
    for line in reader.lines() {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match line {
            Ok(line) => {
                if let Some(notification) = parser.feed(&line) {
                    log::debug!(
                        "remote notification: {} change(s) from {}",
                        notification.change_count,
                        notification.source_device_id
                    );
                    on_notification(notification);
                }
            }
            Err(e) => {
                log::debug!("event stream read error: {}", e);
                return;
            }
        }
    }
}

fn reconnect_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(6);
    (INITIAL_RECONNECT_DELAY * 2u32.pow(exp)).min(MAX_RECONNECT_DELAY)
}

fn interruptible_sleep(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total && !shutdown.load(Ordering::SeqCst) {
        thread::sleep(step);
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parsing() {
        let mut parser = FrameParser::default();
        assert_eq!(parser.feed("id: cursor-1"), None);
        assert_eq!(
            parser.feed(r#"data: {"source_device_id": "dev-2", "change_count": 3}"#),
            None
        );
        let notification = parser.feed("").expect("blank line dispatches");
        assert_eq!(notification.source_device_id, "dev-2");
        assert_eq!(notification.change_count, 3);
        assert_eq!(parser.cursor(), Some("cursor-1"));
    }

    #[test]
    fn test_keepalives_and_garbage_ignored() {
        let mut parser = FrameParser::default();
        assert_eq!(parser.feed(": keepalive"), None);
        assert_eq!(parser.feed("unknown-field: zzz"), None);
        assert_eq!(parser.feed(""), None);
        assert_eq!(parser.feed("data: not json"), None);
        assert_eq!(parser.feed(""), None);
        assert_eq!(parser.cursor(), None);
    }

    #[test]
    fn test_cursor_advances_without_data() {
        let mut parser = FrameParser::default();
        parser.feed("id: a");
        parser.feed("");
        assert_eq!(parser.cursor(), Some("a"));
        // A later frame moves it again.
        parser.feed("id: b");
        parser.feed(r#"data: {"source_device_id": "d", "change_count": 1}"#);
        assert!(parser.feed("").is_some());
        assert_eq!(parser.cursor(), Some("b"));
    }

    #[test]
    fn test_drain_mid_frame() {
        let mut parser = FrameParser::default();
        parser.feed("id: x");
        parser.feed(r#"data: {"source_device_id": "d", "change_count": 2}"#);
        // Stream died before the blank line.
        let notification = parser.drain().expect("buffered frame flushes");
        assert_eq!(notification.change_count, 2);
        assert_eq!(parser.cursor(), Some("x"));
    }

    #[test]
    fn test_stream_reader_dispatches() {
        let stream = b"id: c1\r\ndata: {\"source_device_id\": \"d1\", \"change_count\": 1}\r\n\r\n\
id: c2\ndata: {\"source_device_id\": \"d2\", \"change_count\": 5}\n\n";
        let mut parser = FrameParser::default();
        let seen = std::sync::Mutex::new(Vec::new());
        read_stream(
            &stream[..],
            &mut parser,
            &|n| seen.lock().unwrap().push(n),
            &AtomicBool::new(false),
        );
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].source_device_id, "d1");
        assert_eq!(seen[1].change_count, 5);
        assert_eq!(parser.cursor(), Some("c2"));
    }

    #[test]
    fn test_reconnect_delay_backs_off_and_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(reconnect_delay(2), Duration::from_secs(1));
        assert_eq!(reconnect_delay(3), Duration::from_secs(2));
        assert_eq!(reconnect_delay(20), Duration::from_secs(30));
    }
}
