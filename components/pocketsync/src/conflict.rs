/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Conflict resolution: given the local and remote versions of one row,
// pick the winner.  Deletions participate as tombstones - a timestamped
// absence - so "they deleted it, we edited it" resolves the same way any
// other conflict does.

use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use sync_guid::Guid;
use types::Timestamp;

use crate::error::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// The row with the larger timestamp wins; ties broken by comparing
    /// global ids.  The default.
    LastWriteWins,
    /// The remote row wins unconditionally.
    ServerWins,
    /// The local row wins unconditionally.
    ClientWins,
    /// Delegate to a user-supplied function.
    Custom,
}

/// One version of a row as conflict resolution sees it.  `data` of `None`
/// is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct RowVersion {
    pub global_id: Guid,
    pub data: Option<Map<String, JsonValue>>,
    pub timestamp: Timestamp,
}

impl RowVersion {
    pub fn new(global_id: Guid, data: Map<String, JsonValue>, timestamp: Timestamp) -> Self {
        Self {
            global_id,
            data: Some(data),
            timestamp,
        }
    }

    pub fn tombstone(global_id: Guid, timestamp: Timestamp) -> Self {
        Self {
            global_id,
            data: None,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// A custom resolver must be deterministic - it can be invoked repeatedly
/// for the same inputs across retries.  Returning `Err` signals the row is
/// unresolvable; the change stays queued and is retried on the next pass.
pub type CustomResolver =
    dyn Fn(&str, &RowVersion, &RowVersion) -> std::result::Result<RowVersion, String>
        + Send
        + Sync;

pub struct ConflictResolver {
    strategy: ConflictStrategy,
    custom: Option<Arc<CustomResolver>>,
}

impl ConflictResolver {
    pub fn new(
        strategy: ConflictStrategy,
        custom: Option<Arc<CustomResolver>>,
    ) -> Result<Self> {
        if strategy == ConflictStrategy::Custom && custom.is_none() {
            return Err(Error::Schema(
                "conflict_strategy is Custom but no custom_resolver was supplied".into(),
            ));
        }
        Ok(Self { strategy, custom })
    }

    pub fn resolve(
        &self,
        table: &str,
        local: &RowVersion,
        remote: &RowVersion,
    ) -> Result<RowVersion> {
        let winner = match self.strategy {
            ConflictStrategy::ServerWins => remote.clone(),
            ConflictStrategy::ClientWins => local.clone(),
            ConflictStrategy::LastWriteWins => {
                if local.timestamp > remote.timestamp {
                    local.clone()
                } else if remote.timestamp > local.timestamp {
                    remote.clone()
                } else if local.global_id > remote.global_id {
                    local.clone()
                } else {
                    // A full tie means the same row; the server copy is as
                    // good as ours and every device converges on it.
                    remote.clone()
                }
            }
            ConflictStrategy::Custom => {
                let resolver = self
                    .custom
                    .as_ref()
                    .expect("validated at construction");
                resolver(table, local, remote).map_err(|reason| Error::Conflict {
                    table: table.to_owned(),
                    global_id: local.global_id.to_string(),
                    reason,
                })?
            }
        };
        log::trace!(
            "resolved '{}' row '{}': local@{} vs remote@{} -> {}@{}",
            table,
            local.global_id,
            local.timestamp,
            remote.timestamp,
            if winner.is_tombstone() { "tombstone" } else { "row" },
            winner.timestamp,
        );
        Ok(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(gid: &str, name: &str, ts: u64) -> RowVersion {
        let mut data = Map::new();
        data.insert("name".into(), json!(name));
        RowVersion::new(Guid::from(gid), data, Timestamp(ts))
    }

    fn lww() -> ConflictResolver {
        ConflictResolver::new(ConflictStrategy::LastWriteWins, None).unwrap()
    }

    #[test]
    fn test_lww_newer_remote_wins() {
        let local = row("r1", "A", 100);
        let remote = row("r1", "B", 200);
        let winner = lww().resolve("todos", &local, &remote).unwrap();
        assert_eq!(winner.data.unwrap()["name"], "B");
    }

    #[test]
    fn test_lww_stale_remote_loses() {
        let local = row("r1", "A", 200);
        let remote = row("r1", "B", 100);
        let winner = lww().resolve("todos", &local, &remote).unwrap();
        assert_eq!(winner.data.unwrap()["name"], "A");
    }

    #[test]
    fn test_lww_tie_is_deterministic() {
        let local = row("r1", "A", 100);
        let remote = row("r1", "B", 100);
        let winner = lww().resolve("todos", &local, &remote).unwrap();
        // Equal ids: the remote copy is chosen, on every device.
        assert_eq!(winner.data.unwrap()["name"], "B");
    }

    #[test]
    fn test_lww_tombstones() {
        // A later tombstone deletes the row.
        let local = row("r1", "A", 100);
        let tombstone = RowVersion::tombstone(Guid::from("r1"), Timestamp(200));
        let winner = lww().resolve("todos", &local, &tombstone).unwrap();
        assert!(winner.is_tombstone());

        // An earlier tombstone is discarded.
        let stale_tombstone = RowVersion::tombstone(Guid::from("r1"), Timestamp(50));
        let winner = lww().resolve("todos", &local, &stale_tombstone).unwrap();
        assert!(!winner.is_tombstone());
    }

    #[test]
    fn test_unconditional_strategies() {
        let local = row("r1", "A", 900);
        let remote = row("r1", "B", 100);
        let server = ConflictResolver::new(ConflictStrategy::ServerWins, None).unwrap();
        assert_eq!(
            server.resolve("t", &local, &remote).unwrap().data.unwrap()["name"],
            "B"
        );
        let client = ConflictResolver::new(ConflictStrategy::ClientWins, None).unwrap();
        assert_eq!(
            client.resolve("t", &local, &remote).unwrap().data.unwrap()["name"],
            "A"
        );
    }

    #[test]
    fn test_custom_resolver() {
        let resolver = ConflictResolver::new(
            ConflictStrategy::Custom,
            Some(Arc::new(|_table: &str, local: &RowVersion, remote: &RowVersion| {
                // Merge: keep whichever name is alphabetically first.
                let l = local.data.as_ref().unwrap()["name"].as_str().unwrap();
                let r = remote.data.as_ref().unwrap()["name"].as_str().unwrap();
                Ok(if l <= r { local.clone() } else { remote.clone() })
            })),
        )
        .unwrap();
        let winner = resolver
            .resolve("todos", &row("r1", "B", 100), &row("r1", "A", 200))
            .unwrap();
        assert_eq!(winner.data.unwrap()["name"], "A");
    }

    #[test]
    fn test_custom_resolver_error() {
        let resolver = ConflictResolver::new(
            ConflictStrategy::Custom,
            Some(Arc::new(|_: &str, _: &RowVersion, _: &RowVersion| {
                Err("can't decide".to_string())
            })),
        )
        .unwrap();
        let err = resolver
            .resolve("todos", &row("r1", "A", 1), &row("r1", "B", 2))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn test_custom_requires_resolver() {
        assert!(ConflictResolver::new(ConflictStrategy::Custom, None).is_err());
    }
}
