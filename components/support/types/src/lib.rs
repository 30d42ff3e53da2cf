/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Result as RusqliteResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Typesafe way to manage millisecond timestamps. Everything the sync core
/// records - change capture times, device watermarks, wire records - uses
/// this rather than a raw i64.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Returns None if `other` is later than `self` (Duration may not
    /// represent negative timespans in rust).
    #[inline]
    pub fn duration_since(self, other: Timestamp) -> Option<Duration> {
        SystemTime::from(self).duration_since(other.into()).ok()
    }

    #[inline]
    pub fn checked_sub(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_sub(d).map(Timestamp::from)
    }

    #[inline]
    pub fn checked_add(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_add(d).map(Timestamp::from)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_millis_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    #[inline]
    fn from(st: SystemTime) -> Self {
        // The system clock being before 1970 means something is badly wrong;
        // clamp rather than panic.
        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(d.as_secs() * 1000 + u64::from(d.subsec_millis()))
    }
}

impl From<Timestamp> for SystemTime {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_millis(ts.into())
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(ts: i64) -> Self {
        // Negative timestamps can only come from corrupt data; clamp to 0.
        Timestamp(u64::try_from(ts).unwrap_or(0))
    }
}

impl fmt::Display for Timestamp {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64)) // hrm - no u64 in rusqlite
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(|v| Timestamp(v as u64)) // hrm - no u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering_and_math() {
        let early = Timestamp(1_000);
        let late = Timestamp(4_500);
        assert!(early < late);
        assert_eq!(late.duration_since(early), Some(Duration::from_millis(3_500)));
        assert_eq!(early.duration_since(late), None);
        assert_eq!(
            early.checked_add(Duration::from_millis(500)),
            Some(Timestamp(1_500))
        );
    }

    #[test]
    fn test_timestamp_sql_round_trip() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (ts INTEGER)").unwrap();
        let ts = Timestamp(1_234_567_890_123);
        conn.execute("INSERT INTO t (ts) VALUES (?)", [ts]).unwrap();
        let got: Timestamp = conn
            .query_row("SELECT ts FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(got, ts);
    }

    #[test]
    fn test_timestamp_serde() {
        let ts = Timestamp(42);
        let s = serde_json::to_string(&ts).unwrap();
        assert_eq!(s, "42");
        let back: Timestamp = serde_json::from_str(&s).unwrap();
        assert_eq!(back, ts);
    }
}
