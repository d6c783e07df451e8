//! Per-shared-plan change-log: the record of what must be re-deployed.
//!
//! Every mutation of a shared plan appends exactly one [`ChangeLogEntry`]
//! delimiting the affected operator sub-DAG by its minimal upstream and
//! downstream operator sets. Amenders consume entries up to the timestamp
//! watermark they observed at acquire time; entries appended concurrently
//! survive the amendment.
//!
//! Invariants kept here:
//! - Timestamps are microsecond wall-clock values, forced **strictly
//!   monotonic** per log.
//! - Every operator appears in at most one live entry: appending an entry
//!   that overlaps existing live entries absorbs them into one union entry
//!   under a fresh timestamp, so the log only ever grows at the tail.

use crate::operator::OperatorId;
use crate::utils::now_micros;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A contiguous sub-DAG requiring re-deployment, bounded by its upstream
/// (source-side) and downstream (sink-side) operator sets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub upstream: BTreeSet<OperatorId>,
    pub downstream: BTreeSet<OperatorId>,
}

impl ChangeLogEntry {
    #[must_use]
    pub fn new(
        upstream: impl IntoIterator<Item = OperatorId>,
        downstream: impl IntoIterator<Item = OperatorId>,
    ) -> Self {
        Self {
            upstream: upstream.into_iter().collect(),
            downstream: downstream.into_iter().collect(),
        }
    }

    /// True if the two entries share any boundary operator.
    #[must_use]
    pub fn overlaps(&self, other: &ChangeLogEntry) -> bool {
        let touches = |set: &BTreeSet<OperatorId>| {
            set.iter()
                .any(|id| other.upstream.contains(id) || other.downstream.contains(id))
        };
        touches(&self.upstream) || touches(&self.downstream)
    }

    /// All boundary operators of the entry.
    #[must_use]
    pub fn operators(&self) -> BTreeSet<OperatorId> {
        self.upstream.union(&self.downstream).copied().collect()
    }

    fn absorb(&mut self, other: ChangeLogEntry) {
        self.upstream.extend(other.upstream);
        self.downstream.extend(other.downstream);
    }
}

/// Insertion-ordered log of change-log entries with monotonic timestamps.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChangeLog {
    entries: Vec<(u64, ChangeLogEntry)>,
    last_timestamp: u64,
}

impl ChangeLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its timestamp.
    ///
    /// Live entries sharing any operator with the new one are absorbed into
    /// it first; the union entry lands at the tail under a fresh timestamp.
    pub fn append(&mut self, mut entry: ChangeLogEntry) -> u64 {
        let mut kept = Vec::with_capacity(self.entries.len() + 1);
        for (ts, existing) in self.entries.drain(..) {
            if entry.overlaps(&existing) {
                entry.absorb(existing);
            } else {
                kept.push((ts, existing));
            }
        }
        let ts = self.next_timestamp();
        kept.push((ts, entry));
        self.entries = kept;
        ts
    }

    /// Entries with a timestamp at or below `up_to`, in insertion order.
    #[must_use]
    pub fn entries_up_to(&self, up_to: u64) -> Vec<(u64, &ChangeLogEntry)> {
        self.entries
            .iter()
            .filter(|(ts, _)| *ts <= up_to)
            .map(|(ts, e)| (*ts, e))
            .collect()
    }

    /// Drop every entry with a timestamp at or below `watermark`. Called by
    /// the amender after a successful commit.
    pub fn consume_up_to(&mut self, watermark: u64) {
        self.entries.retain(|(ts, _)| *ts > watermark);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Timestamp of the newest entry, or 0 for an empty log.
    #[must_use]
    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn next_timestamp(&mut self) -> u64 {
        let ts = now_micros().max(self.last_timestamp + 1);
        self.last_timestamp = ts;
        ts
    }
}
