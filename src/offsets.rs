//! Per-consumer offset bookkeeping.
//!
//! The stored offset of a partition is always the *next* offset to fetch.
//! It advances only when a record has actually been handed to the caller, so
//! a remote commit can never run ahead of what was delivered.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cluster::TopicPartition;
use crate::protocol::messages::{OFFSET_BEGINNING, OFFSET_END};

/// Where to start consuming a topic when no stored offset exists.
///
/// Honored on the first consumption of a topic and again after an
/// offset-out-of-range error; otherwise the stored offset wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Start {
    /// Tail of the log: only records produced from now on.
    #[default]
    End,

    /// Head of the log: everything the broker still has.
    Beginning,

    /// Records at or after an absolute point in time.
    ///
    /// Resolution happens broker-side and inherits the broker clock's skew.
    At(DateTime<Utc>),

    /// Records at or after `now - duration`.
    Ago(Duration),
}

impl Start {
    /// The timestamp value the offset API expects for this start position.
    pub(crate) fn to_timestamp(self) -> i64 {
        match self {
            Self::End => OFFSET_END.0,
            Self::Beginning => OFFSET_BEGINNING.0,
            Self::At(at) => at.timestamp_millis(),
            Self::Ago(ago) => {
                (Utc::now() - chrono::Duration::from_std(ago).unwrap_or_default())
                    .timestamp_millis()
            }
        }
    }
}

/// Offset state of one consumer instance.
#[derive(Debug, Default)]
pub(crate) struct OffsetTable {
    /// Next offset to fetch per partition.
    offsets: HashMap<TopicPartition, i64>,

    /// Highest offset acknowledged by a remote commit per partition.
    committed: HashMap<TopicPartition, i64>,

    /// Topics whose offsets were seeded from a start hint or a remote store.
    synced: HashSet<String>,
}

impl OffsetTable {
    /// The next offset to fetch, if one is known.
    pub(crate) fn next_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.offsets.get(tp).copied()
    }

    /// Advance past a record that was delivered to the caller.
    pub(crate) fn record_delivered(&mut self, tp: TopicPartition, offset: i64) {
        let next = offset + 1;
        let entry = self.offsets.entry(tp).or_insert(next);
        *entry = (*entry).max(next);
    }

    /// Seed the next offset, e.g. from a start hint or a remote store.
    pub(crate) fn seed(&mut self, tp: TopicPartition, next_offset: i64) {
        self.offsets.insert(tp, next_offset);
    }

    pub(crate) fn is_synced(&self, topic: &str) -> bool {
        self.synced.contains(topic)
    }

    pub(crate) fn mark_synced(&mut self, topic: &str) {
        self.synced.insert(topic.to_owned());
    }

    /// Forget that a topic is synced, forcing the start hint to be
    /// re-applied on the next consume.
    pub(crate) fn desync(&mut self, topic: &str) {
        self.synced.remove(topic);
    }

    pub(crate) fn desync_all(&mut self) {
        self.synced.clear();
    }

    /// The values a remote commit should carry for `topics`.
    ///
    /// Commits never regress: the value is clamped to the highest offset a
    /// previous commit acknowledged.
    pub(crate) fn commit_values(&self, topics: &HashSet<String>) -> BTreeMap<TopicPartition, i64> {
        self.offsets
            .iter()
            .filter(|(tp, _)| topics.contains(&tp.topic))
            .map(|(tp, offset)| {
                let floor = self.committed.get(tp).copied().unwrap_or(i64::MIN);
                (tp.clone(), (*offset).max(floor))
            })
            .collect()
    }

    /// Record that a remote commit for a partition was acknowledged.
    pub(crate) fn mark_committed(&mut self, tp: TopicPartition, offset: i64) {
        let entry = self.committed.entry(tp).or_insert(offset);
        *entry = (*entry).max(offset);
    }
}
