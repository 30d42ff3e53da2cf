/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The wire shapes shared with the coordinator.  Transport-agnostic: the
// HTTP client serializes these as JSON, tests construct them directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sync_guid::Guid;
use types::Timestamp;

pub const CHANGE_SET_VERSION: i32 = 1;

/// One row as it travels: its cross-device identity, its column state, and
/// the timestamp of the change that produced it.  Deletions ship with empty
/// `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRow {
    pub primary_key: Guid,
    #[serde(default)]
    pub data: Map<String, JsonValue>,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub version: i32,
}

/// The unit of upload: everything one device changed, grouped by operation
/// and table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub timestamp: Timestamp,
    pub version: i32,
    #[serde(default)]
    pub updates: HashMap<String, Vec<WireRow>>,
    #[serde(default)]
    pub insertions: HashMap<String, Vec<WireRow>>,
    #[serde(default)]
    pub deletions: HashMap<String, Vec<WireRow>>,
}

impl ChangeSet {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            version: CHANGE_SET_VERSION,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.insertions.is_empty() && self.deletions.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.updates.values().map(Vec::len).sum::<usize>()
            + self.insertions.values().map(Vec::len).sum::<usize>()
            + self.deletions.values().map(Vec::len).sum::<usize>()
    }
}

/// One device's upload as the server hands it back out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLog {
    pub id: String,
    pub device_id: String,
    pub received_at: Timestamp,
    pub processed_at: Timestamp,
    pub user_identifier: String,
    pub change_set: ChangeSet,
}

/// What the event channel delivers: a hint that some other device uploaded.
/// Never authoritative data - it only triggers a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNotification {
    pub source_device_id: String,
    pub change_count: i32,
}

/// The server's acknowledgement of a `POST /changes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadAck {
    #[serde(default)]
    pub server_ids: Vec<String>,
    #[serde(default)]
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_set_round_trip() {
        let mut set = ChangeSet::new(Timestamp(1_000));
        let mut data = Map::new();
        data.insert("name".into(), json!("B"));
        set.updates.insert(
            "todos".into(),
            vec![WireRow {
                primary_key: Guid::from("r1"),
                data,
                timestamp: Timestamp(200),
                version: CHANGE_SET_VERSION,
            }],
        );
        assert!(!set.is_empty());
        assert_eq!(set.change_count(), 1);

        let encoded = serde_json::to_string(&set).unwrap();
        let decoded: ChangeSet = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_change_log_parses_wire_json() {
        let log: ChangeLog = serde_json::from_value(json!({
            "id": "c1",
            "device_id": "other-device",
            "received_at": 150,
            "processed_at": 160,
            "user_identifier": "user-1",
            "change_set": {
                "timestamp": 150,
                "version": 1,
                "updates": {
                    "todos": [
                        {"primary_key": "r1", "data": {"name": "B"}, "timestamp": 200, "version": 1}
                    ]
                }
            }
        }))
        .unwrap();
        assert_eq!(log.change_set.updates["todos"][0].primary_key, "r1");
        // Absent groups default to empty.
        assert!(log.change_set.deletions.is_empty());
    }
}
