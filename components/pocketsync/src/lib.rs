/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! An offline-first sync engine for embedded SQLite: every local mutation
//! is captured by triggers into a durable change log, shipped to a remote
//! coordinator, and merged with other devices' changes through a
//! deterministic conflict resolver.  Live queries re-emit whenever the
//! merged data moves underneath them.

pub mod config;
pub mod conflict;
mod db;
pub mod error;
mod notifier;
mod schema;
mod scheduler;
mod sql_extract;
pub mod storage;
mod store;
pub mod sync;
pub mod transport;
mod watcher;

pub use config::SyncOptions;
pub use conflict::{ConflictStrategy, CustomResolver, RowVersion};
pub use error::{Error, Result};
pub use storage::changes::{Operation, PruneStats};
pub use storage::device::DeviceState;
pub use store::PocketSync;
pub use sync::record::{ChangeLog, ChangeSet, RemoteNotification, UploadAck, WireRow};
pub use transport::Transport;
pub use watcher::{WatchEvent, WatchHandle};
