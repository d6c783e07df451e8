//! Utility types and functions for Fluxmesh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the Unix epoch.
///
/// Change-log timestamps are derived from this value but are additionally
/// forced strictly monotonic per shared plan (see
/// [`ChangeLog`](crate::changelog::ChangeLog)).
#[must_use]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A process-wide monotonic id source.
///
/// Each call to [`IdSequence::next`] returns a fresh non-zero value. Used for
/// operator and request ids, where uniqueness must hold across every plan in
/// the coordinator, not just within one.
#[derive(Debug)]
pub struct IdSequence(AtomicU64);

impl IdSequence {
    /// Create a sequence starting at 1 (0 is reserved as "invalid").
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Return the next value in the sequence.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}
