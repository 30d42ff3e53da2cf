/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub mod incoming;
pub mod outgoing;
pub mod record;

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use sync_guid::Guid;

/// Per-row locks keyed on `(table, global_id)`.  The uploader takes a row's
/// lock while reading its current state into a wire record; the downloader
/// takes it while applying a resolved row.  This keeps the two directions
/// from interleaving on the same row even though they run on different
/// connections.
#[derive(Default)]
pub struct RowLocks {
    held: Mutex<HashSet<(String, Guid)>>,
    cond: Condvar,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, table: &str, global_id: &Guid) -> RowLockGuard<'_> {
        let key = (table.to_owned(), global_id.clone());
        let mut held = self.held.lock();
        while held.contains(&key) {
            self.cond.wait(&mut held);
        }
        held.insert(key.clone());
        RowLockGuard { locks: self, key }
    }
}

pub struct RowLockGuard<'a> {
    locks: &'a RowLocks,
    key: (String, Guid),
}

impl Drop for RowLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        held.remove(&self.key);
        self.locks.cond.notify_all();
    }
}
