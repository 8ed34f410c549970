// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Captured channel writes.
//!
//! A [`PlayableRecord`] is one captured write: the channel alias, the
//! channel's write timestamp and an owned clone of the payload, immutable
//! after capture. A [`RecordStore`] keeps records globally ordered by
//! timestamp with ties broken by insertion order.

use std::collections::BTreeMap;
use std::sync::Arc;

use weir_util::array::Array;
use weir_util::time::Timestamp;

use crate::channel::Channel;

/// One captured channel write.
#[derive(Clone, Debug)]
pub struct PlayableRecord {
    pub name: String,
    pub timestamp: Timestamp,
    pub value: Arc<Array>,
}

/// The capability of accepting captured writes.
pub trait RecordSink: Send + Sync {
    fn record(&self, alias: &str, channel: &Channel);
}

/// Records ordered by timestamp, ties by insertion order.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: BTreeMap<(Timestamp, u64), PlayableRecord>,
    seq: u64,
}

// === impl PlayableRecord ===

impl PlayableRecord {
    /// Captures the current state of `channel` under `alias`.
    pub fn capture(alias: &str, channel: &Channel) -> Self {
        Self {
            name: alias.to_owned(),
            timestamp: channel.timestamp(),
            value: Arc::new(channel.clone_array()),
        }
    }
}

// === impl RecordStore ===

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: PlayableRecord) {
        let key = (record.timestamp, self.seq);
        self.seq += 1;
        self.records.insert(key, record);
    }

    /// Removes and returns the earliest record.
    pub fn pop_first(&mut self) -> Option<PlayableRecord> {
        self.records.pop_first().map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Records in playback order.
    pub fn iter(&self) -> impl Iterator<Item = &PlayableRecord> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, at: i64) -> PlayableRecord {
        PlayableRecord {
            name: name.to_owned(),
            timestamp: Timestamp::new(at),
            value: Arc::new(Array::from_values(&[0i32])),
        }
    }

    #[test]
    fn ordered_by_timestamp_then_insertion() {
        let mut store = RecordStore::new();
        store.insert(record("b", 20));
        store.insert(record("a", 10));
        store.insert(record("tie1", 15));
        store.insert(record("tie2", 15));

        let order: Vec<_> = store.iter().map(|r| r.name.clone()).collect();
        assert_eq!(order, vec!["a", "tie1", "tie2", "b"]);

        assert_eq!(store.pop_first().unwrap().name, "a");
        assert_eq!(store.len(), 3);
        store.clear();
        assert!(store.is_empty());
    }
}
