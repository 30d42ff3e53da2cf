/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network unreachable, 5xx, timeouts.  Retried with backoff by the
    /// scheduler; only surfaced once the circuit breaker opens.
    #[error("Transport error: {0}")]
    Transport(String),

    /// 401/403.  Never retried; the scheduler pauses until credentials
    /// change.
    #[error("Authentication failed (HTTP {status})")]
    Auth { status: u16 },

    /// A custom resolver explicitly signalled it can't resolve a row.  The
    /// change stays unsynced and is retried on the next pass.
    #[error("Conflict for '{table}' row '{global_id}' could not be resolved: {reason}")]
    Conflict {
        table: String,
        global_id: String,
        reason: String,
    },

    /// Fatal at initialization - the schema could not be augmented.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A watermark update that would move a device timestamp backwards.
    #[error("Timestamp regression: {name} {current} -> {proposed}")]
    TimestampRegression {
        name: &'static str,
        current: types::Timestamp,
        proposed: types::Timestamp,
    },

    #[error("Unexpected HTTP status {status} from {route}")]
    UnexpectedStatus { status: u16, route: String },

    #[error("Error parsing URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Error parsing JSON data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error executing SQL: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabase(#[from] sql_support::open_database::Error),

    #[error("The operation was interrupted")]
    Interrupted(#[from] interrupt_support::Interrupted),
}

impl Error {
    /// True for errors the scheduler should absorb and retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::UnexpectedStatus { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    /// A one-word label recorded in the device state's `last_sync_status`.
    pub fn status_label(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Auth { .. } => "auth",
            Error::Conflict { .. } => "conflict",
            Error::Schema(_) => "schema",
            Error::Interrupted(_) => "interrupted",
            _ => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
