/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::conflict::{ConflictStrategy, CustomResolver};
use crate::transport::Transport;

/// Everything `PocketSync::initialize` needs.  Construct with `new` and
/// override the knobs you care about; the defaults match the production
/// service.
#[derive(Clone)]
pub struct SyncOptions {
    /// Path to the database file.  Use `file:name?mode=memory&cache=shared`
    /// style URIs for tests.
    pub db_path: PathBuf,
    pub server_url: String,
    pub project_id: String,
    pub auth_token: String,
    /// May be empty at init time and supplied later via `set_user_id` -
    /// sync is gated until it's known.
    pub user_id: Option<String>,

    pub conflict_strategy: ConflictStrategy,
    /// Required iff `conflict_strategy` is `Custom`.
    pub custom_resolver: Option<Arc<CustomResolver>>,

    /// How long the scheduler waits after a local change before uploading.
    pub debounce_interval: Duration,
    /// How long the notifier waits to coalesce bursts of table
    /// notifications before fanning them out.
    pub notifier_debounce: Duration,
    /// Maximum number of change-log rows read per upload pass.
    pub max_batch_size: usize,
    /// Synced change-log rows older than this are pruned.
    pub retention_window: Duration,
    /// Hard cap on unsynced change-log rows; the oldest excess is dropped.
    pub queue_hard_cap: usize,
    /// Per-request timeout on the batch channel.
    pub request_timeout: Duration,
    /// Consecutive task failures before the circuit breaker opens.
    pub breaker_threshold: u32,
    /// Consecutive event-channel reconnect failures before it gives up.
    pub event_reconnect_cap: u32,

    /// Host-supplied platform probe data, hashed into the device id on
    /// first run.  When absent a random identifier is generated instead.
    pub device_fingerprint: Option<String>,

    pub verbose: bool,

    /// Test seam, and an escape hatch for hosts with their own channel:
    /// when set, this replaces the HTTP batch channel and no event channel
    /// is started.
    pub transport: Option<Arc<dyn Transport>>,
}

impl SyncOptions {
    pub fn new(
        db_path: impl Into<PathBuf>,
        server_url: impl Into<String>,
        project_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            server_url: server_url.into(),
            project_id: project_id.into(),
            auth_token: auth_token.into(),
            user_id: None,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            custom_resolver: None,
            debounce_interval: Duration::from_secs(3),
            notifier_debounce: Duration::from_millis(150),
            max_batch_size: 1_000,
            retention_window: Duration::from_secs(7 * 24 * 60 * 60),
            queue_hard_cap: 10_000,
            request_timeout: Duration::from_secs(30),
            breaker_threshold: 5,
            event_reconnect_cap: 10,
            device_fingerprint: None,
            verbose: false,
            transport: None,
        }
    }
}
