// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recorded history of one workflow run.
//!
//! A fresh run appends to the history as it goes. A replayed run reads it back
//! through a [`Cursor`], and any call the history cannot answer is reported as
//! a nondeterminism error.

use std::collections::HashMap;

use cadenza_protocol::ProxyError;
use chrono::{DateTime, Utc};

/// Version returned for a change id that was never recorded.
pub(crate) const DEFAULT_VERSION: i32 = -1;

fn mismatch(what: &str) -> ProxyError {
    ProxyError::bad_request(format!("history mismatch: {what} was not recorded"))
}

/// Everything a run observed that replay must reproduce.
#[derive(Debug, Default)]
pub(crate) struct History {
    versions: HashMap<String, i32>,
    mutables: HashMap<String, Vec<Vec<u8>>>,
    times: Vec<DateTime<Utc>>,
    activities: Vec<Result<Vec<u8>, ProxyError>>,
    children: Vec<i64>,
}

/// Read position of one invocation within a [`History`].
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    replaying: bool,
    mutables: HashMap<String, usize>,
    current: HashMap<String, Vec<u8>>,
    times: usize,
    activities: usize,
    children: usize,
}

impl Cursor {
    pub(crate) fn new(replaying: bool) -> Self {
        Self {
            replaying,
            ..Default::default()
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.replaying
    }
}

impl History {
    /// Version for `change_id`: the recorded one if any, else `max_supported`
    /// (recorded) on a fresh run, else [`DEFAULT_VERSION`] on replay.
    pub(crate) fn version(&mut self, cursor: &Cursor, change_id: &str, max_supported: i32) -> i32 {
        if let Some(version) = self.versions.get(change_id) {
            return *version;
        }
        if cursor.replaying {
            return DEFAULT_VERSION;
        }
        self.versions.insert(change_id.to_string(), max_supported);
        max_supported
    }

    /// Record or replay a mutable value.
    ///
    /// Updates return the recorded value at the cursor on replay and record
    /// `value` otherwise. Reads return the last value this invocation saw.
    pub(crate) fn mutable(
        &mut self,
        cursor: &mut Cursor,
        mutable_id: &str,
        value: Option<Vec<u8>>,
        update: bool,
    ) -> Result<Option<Vec<u8>>, ProxyError> {
        if !update {
            return Ok(cursor.current.get(mutable_id).cloned());
        }

        let recorded = self.mutables.entry(mutable_id.to_string()).or_default();
        let value = if cursor.replaying {
            let position = cursor.mutables.entry(mutable_id.to_string()).or_default();
            let value = recorded
                .get(*position)
                .cloned()
                .ok_or_else(|| mismatch(&format!("mutable value '{mutable_id}'")))?;
            *position += 1;
            value
        } else {
            let value = value.unwrap_or_default();
            recorded.push(value.clone());
            value
        };
        cursor.current.insert(mutable_id.to_string(), value.clone());
        Ok(Some(value))
    }

    pub(crate) fn time(
        &mut self,
        cursor: &mut Cursor,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ProxyError> {
        if cursor.replaying {
            let time = *self
                .times
                .get(cursor.times)
                .ok_or_else(|| mismatch("workflow time"))?;
            cursor.times += 1;
            return Ok(time);
        }
        self.times.push(now);
        Ok(now)
    }

    /// Recorded outcome of the next local activity, or `None` on a fresh run.
    pub(crate) fn replay_activity(
        &self,
        cursor: &mut Cursor,
    ) -> Option<Result<Vec<u8>, ProxyError>> {
        if !cursor.replaying {
            return None;
        }
        let outcome = self
            .activities
            .get(cursor.activities)
            .cloned()
            .unwrap_or_else(|| Err(mismatch("local activity")));
        cursor.activities += 1;
        Some(outcome)
    }

    pub(crate) fn record_activity(&mut self, outcome: Result<Vec<u8>, ProxyError>) {
        self.activities.push(outcome);
    }

    /// Recorded id of the next child workflow, or `None` on a fresh run.
    pub(crate) fn replay_child(&self, cursor: &mut Cursor) -> Option<Result<i64, ProxyError>> {
        if !cursor.replaying {
            return None;
        }
        let child = self
            .children
            .get(cursor.children)
            .copied()
            .ok_or_else(|| mismatch("child workflow"));
        cursor.children += 1;
        Some(child)
    }

    pub(crate) fn record_child(&mut self, child_id: i64) {
        self.children.push(child_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_protocol::ErrorKind;

    #[test]
    fn test_version_sticks_across_replay() {
        let mut history = History::default();
        let fresh = Cursor::new(false);
        assert_eq!(history.version(&fresh, "new-branch", 2), 2);
        // Range changes after the first record are ignored.
        assert_eq!(history.version(&fresh, "new-branch", 5), 2);

        let replay = Cursor::new(true);
        assert_eq!(history.version(&replay, "new-branch", 7), 2);
        assert_eq!(history.version(&replay, "unknown", 7), DEFAULT_VERSION);
    }

    #[test]
    fn test_mutable_replays_recorded_values_in_order() {
        let mut history = History::default();
        let mut fresh = Cursor::new(false);
        history
            .mutable(&mut fresh, "seed", Some(vec![1]), true)
            .unwrap();
        history
            .mutable(&mut fresh, "seed", Some(vec![2]), true)
            .unwrap();
        assert_eq!(
            history.mutable(&mut fresh, "seed", None, false).unwrap(),
            Some(vec![2])
        );

        let mut replay = Cursor::new(true);
        assert_eq!(history.mutable(&mut replay, "seed", None, false).unwrap(), None);
        assert_eq!(
            history
                .mutable(&mut replay, "seed", Some(vec![9]), true)
                .unwrap(),
            Some(vec![1])
        );
        assert_eq!(
            history
                .mutable(&mut replay, "seed", Some(vec![9]), true)
                .unwrap(),
            Some(vec![2])
        );
        let err = history
            .mutable(&mut replay, "seed", Some(vec![9]), true)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn test_time_replays_recorded_clock() {
        let mut history = History::default();
        let recorded = Utc::now();
        history.time(&mut Cursor::new(false), recorded).unwrap();

        let mut replay = Cursor::new(true);
        let later = recorded + chrono::Duration::hours(1);
        assert_eq!(history.time(&mut replay, later).unwrap(), recorded);
        assert!(history.time(&mut replay, later).is_err());
    }

    #[test]
    fn test_activity_and_child_replay() {
        let mut history = History::default();
        let mut fresh = Cursor::new(false);
        assert!(history.replay_activity(&mut fresh).is_none());
        history.record_activity(Ok(vec![4]));
        history.record_child(11);

        let mut replay = Cursor::new(true);
        assert_eq!(history.replay_activity(&mut replay), Some(Ok(vec![4])));
        assert!(matches!(history.replay_activity(&mut replay), Some(Err(_))));
        assert_eq!(history.replay_child(&mut replay), Some(Ok(11)));
    }
}
