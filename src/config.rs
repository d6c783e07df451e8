//! Coordinator configuration.
//!
//! [`CoordinatorConfig`] collects the tunables of the query-plan coordination
//! core: which merger rule fuses equivalent queries, whether placement is
//! incremental, and how the placement-amendment pool runs (size, concurrency
//! discipline, retry budgets).
//!
//! Plain public fields with [`Default`] so callers can use struct-update
//! syntax:
//!
//! ```
//! use fluxmesh::config::{CoordinatorConfig, PlacementAmendmentMode, QueryMergerRule};
//!
//! let config = CoordinatorConfig {
//!     query_merger_rule: QueryMergerRule::SignatureBasedComplete,
//!     placement_amendment_mode: PlacementAmendmentMode::Optimistic,
//!     enable_query_reconfiguration: true,
//!     ..Default::default()
//! };
//! assert!(config.placement_amendment_thread_count >= 2);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which rule the global query plan uses to fuse equivalent queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMergerRule {
    /// Exact tree-isomorphism over operator DAGs with identical source sets.
    SyntaxBasedComplete,
    /// Full sink-to-source signature equality.
    SignatureBasedComplete,
    /// Maximal common upstream sub-DAG by signature; both sinks retained.
    SignatureBasedPartial,
    /// No merging: every query gets its own shared plan.
    #[default]
    Default,
}

impl QueryMergerRule {
    /// True if the rule consumes operator signatures and therefore requires
    /// signature inference to succeed before the batch can be applied.
    #[must_use]
    pub fn needs_signatures(&self) -> bool {
        matches!(
            self,
            Self::SignatureBasedComplete | Self::SignatureBasedPartial
        )
    }
}

/// Concurrency discipline of the placement amenders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementAmendmentMode {
    /// Two-phase locking: resources locked in canonical order, held to commit.
    #[default]
    Pessimistic,
    /// Optimistic concurrency control: snapshot, compute, validate-and-swap.
    Optimistic,
}

/// Tunables of the coordination core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Rule used to fuse syntactically or semantically equivalent queries.
    pub query_merger_rule: QueryMergerRule,
    /// When true, only operators listed in change-log entries are re-placed;
    /// placed-and-untouched operators keep their resources.
    pub enable_incremental_placement: bool,
    /// Size of the placement-amendment worker pool.
    pub placement_amendment_thread_count: usize,
    /// Concurrency discipline of the amenders.
    pub placement_amendment_mode: PlacementAmendmentMode,
    /// Accept topology-mutation requests interleaved with queries.
    pub enable_query_reconfiguration: bool,
    /// Optimistic validation retries per amendment before the shared plan is
    /// left `Optimizing` with its change-log intact.
    pub occ_retry_count: u32,
    /// How long a 2PL write-lock acquisition may block before it counts as a
    /// timeout.
    pub lock_timeout: Duration,
    /// Internal retries of a timed-out 2PL acquisition before the failure is
    /// reported as transient.
    pub lock_retry_count: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            query_merger_rule: QueryMergerRule::default(),
            enable_incremental_placement: false,
            placement_amendment_thread_count: num_cpus::get().max(2),
            placement_amendment_mode: PlacementAmendmentMode::default(),
            enable_query_reconfiguration: false,
            occ_retry_count: 3,
            lock_timeout: Duration::from_millis(500),
            lock_retry_count: 3,
        }
    }
}
