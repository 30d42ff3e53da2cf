/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub mod events;
pub mod http;

use parking_lot::RwLock;

use crate::error::*;
use crate::sync::record::{ChangeLog, ChangeSet, UploadAck};
use types::Timestamp;

/// The batch channel to the coordinator.  Object-safe so tests (and hosts
/// with their own plumbing) can swap in a fake.
pub trait Transport: Send + Sync {
    /// Ship a change set; returns on server acknowledgement.
    fn send_changes(&self, change_set: &ChangeSet) -> Result<UploadAck>;

    /// Fetch change logs processed after `since`, in server order.
    fn fetch_changes(&self, since: Option<Timestamp>, limit: usize) -> Result<Vec<ChangeLog>>;
}

/// The identity headers that ride on every request, shared between the
/// batch channel and the event channel.  `user_id` can arrive after
/// initialization.
pub struct RequestContext {
    pub project_id: String,
    pub auth_token: String,
    pub device_id: String,
    user_id: RwLock<Option<String>>,
}

impl RequestContext {
    pub fn new(
        project_id: String,
        auth_token: String,
        device_id: String,
        user_id: Option<String>,
    ) -> Self {
        Self {
            project_id,
            auth_token,
            device_id,
            user_id: RwLock::new(user_id),
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    pub fn set_user_id(&self, user_id: String) {
        *self.user_id.write() = Some(user_id);
    }
}
