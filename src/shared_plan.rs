//! Shared query plans: one merged logical plan hosting one or more queries.
//!
//! A [`SharedQueryPlan`] owns its operator arena, the set of hosted query
//! ids (each with the sink operators serving it), a lifecycle status, and
//! the per-plan [`ChangeLog`]. Operator lookups always indirect through the
//! owning shared plan; neither change-log entries nor neighbor sets hold
//! pointers.
//!
//! Lifecycle: `Created` on first add, `Updated` on every merge, stop, or
//! topology impact, `Optimizing` while an amendment is in flight (and after
//! a failed one, with the change-log intact), `Deployed` after a successful
//! amendment, `Stopped`/`Failed` terminally.

use crate::changelog::{ChangeLog, ChangeLogEntry};
use crate::error::UpdateError;
use crate::operator::{OperatorDag, OperatorId, OperatorState};
use crate::placement::PlacementStrategy;
use crate::query_plan::{QueryId, QueryPlan};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Unique numeric identifier for a shared query plan.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct SharedPlanId(u64);

impl SharedPlanId {
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SharedPlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sqp{}", self.0)
    }
}

/// Lifecycle status of a shared query plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedQueryPlanStatus {
    #[default]
    Created,
    /// Mutated since the last deployment; change-log non-empty.
    Updated,
    /// An amendment is in flight, or the last one failed and left the
    /// change-log intact for a later retry.
    Optimizing,
    Deployed,
    Stopped,
    Failed,
}

/// One merged query plan and its bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedQueryPlan {
    id: SharedPlanId,
    dag: OperatorDag,
    /// Hosted query ids with the sink operators serving each.
    hosted_queries: BTreeMap<QueryId, BTreeSet<OperatorId>>,
    status: SharedQueryPlanStatus,
    change_log: ChangeLog,
    placement_strategy: PlacementStrategy,
}

impl SharedQueryPlan {
    /// Create a shared plan hosting a single query. Every operator starts in
    /// [`OperatorState::ToBePlaced`] and the change-log records the full
    /// sub-DAG (sources up to sinks).
    #[must_use]
    pub fn from_query(id: SharedPlanId, plan: QueryPlan, strategy: PlacementStrategy) -> Self {
        let (query_id, dag, sink) = plan.into_parts();
        let mut shared = Self {
            id,
            dag,
            hosted_queries: BTreeMap::from([(query_id, BTreeSet::from([sink]))]),
            status: SharedQueryPlanStatus::Created,
            change_log: ChangeLog::new(),
            placement_strategy: strategy,
        };
        let entry = ChangeLogEntry::new(shared.dag.sources(), shared.dag.sinks());
        shared.change_log.append(entry);
        shared
    }

    #[must_use]
    pub fn id(&self) -> SharedPlanId {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> SharedQueryPlanStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SharedQueryPlanStatus) {
        self.status = status;
    }

    #[must_use]
    pub fn placement_strategy(&self) -> PlacementStrategy {
        self.placement_strategy
    }

    #[must_use]
    pub fn dag(&self) -> &OperatorDag {
        &self.dag
    }

    #[must_use]
    pub fn dag_mut(&mut self) -> &mut OperatorDag {
        &mut self.dag
    }

    /// Ids of the queries this plan hosts.
    #[must_use]
    pub fn hosted_query_ids(&self) -> Vec<QueryId> {
        self.hosted_queries.keys().copied().collect()
    }

    #[must_use]
    pub fn hosts_query(&self, query_id: QueryId) -> bool {
        self.hosted_queries.contains_key(&query_id)
    }

    /// Sink operators serving one hosted query.
    #[must_use]
    pub fn sinks_of_query(&self, query_id: QueryId) -> Option<&BTreeSet<OperatorId>> {
        self.hosted_queries.get(&query_id)
    }

    /// Record a newly merged query and the sinks serving it. Used by the
    /// merger rules; the matching change-log entry is appended separately.
    pub fn record_hosted_query(&mut self, query_id: QueryId, sinks: BTreeSet<OperatorId>) {
        self.hosted_queries.insert(query_id, sinks);
        self.status = SharedQueryPlanStatus::Updated;
    }

    /// Append a change-log entry and mark the plan updated.
    pub fn append_change_log(&mut self, entry: ChangeLogEntry) -> u64 {
        if !matches!(
            self.status,
            SharedQueryPlanStatus::Created | SharedQueryPlanStatus::Stopped
        ) {
            self.status = SharedQueryPlanStatus::Updated;
        }
        self.change_log.append(entry)
    }

    /// Entries whose timestamp is at or below `up_to`, oldest first.
    #[must_use]
    pub fn change_log_entries(&self, up_to: u64) -> Vec<(u64, &ChangeLogEntry)> {
        self.change_log.entries_up_to(up_to)
    }

    #[must_use]
    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    #[must_use]
    pub fn change_log_mut(&mut self) -> &mut ChangeLog {
        &mut self.change_log
    }

    /// True if the plan must be handed to the deployment layer: it has
    /// pending change-log entries or stopped terminally.
    #[must_use]
    pub fn needs_deployment(&self) -> bool {
        !self.change_log.is_empty() || self.status == SharedQueryPlanStatus::Stopped
    }

    /// Stop one hosted query.
    ///
    /// Operators serving only the stopped query transition to
    /// [`OperatorState::ToBeRemoved`]; shared operators stay. The change-log
    /// records the removed region (most-upstream removed operators up to the
    /// stopped sinks). Stopping the last hosted query marks the whole plan
    /// [`SharedQueryPlanStatus::Stopped`].
    ///
    /// # Errors
    ///
    /// Fails with [`UpdateError::UnknownQuery`] if the query is not hosted.
    pub fn mark_query_stopped(&mut self, query_id: QueryId) -> Result<(), UpdateError> {
        let stopped_sinks = self
            .hosted_queries
            .remove(&query_id)
            .ok_or(UpdateError::UnknownQuery(query_id))?;

        // Operators whose every reachable sink belongs to the stopped query
        // serve nobody else.
        let mut removed = BTreeSet::new();
        for node in self.dag.iter() {
            let reachable = self.reachable_sinks(node.id);
            if !reachable.is_empty() && reachable.is_subset(&stopped_sinks) {
                removed.insert(node.id);
            }
        }
        removed.extend(stopped_sinks.iter().copied());

        for id in &removed {
            if let Some(node) = self.dag.get_mut(*id) {
                node.state = OperatorState::ToBeRemoved;
            }
        }

        // Upstream boundary: removed operators with no removed upstream.
        let upstream: BTreeSet<OperatorId> = removed
            .iter()
            .copied()
            .filter(|id| {
                self.dag
                    .get(*id)
                    .is_some_and(|n| n.upstream().iter().all(|up| !removed.contains(up)))
            })
            .collect();

        self.change_log
            .append(ChangeLogEntry::new(upstream, stopped_sinks));
        self.status = if self.hosted_queries.is_empty() {
            SharedQueryPlanStatus::Stopped
        } else {
            SharedQueryPlanStatus::Updated
        };
        Ok(())
    }

    /// Sinks reachable downstream of `id` (excluding tombstones).
    fn reachable_sinks(&self, id: OperatorId) -> BTreeSet<OperatorId> {
        let mut sinks = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.dag.get(current) else {
                continue;
            };
            if node.state == OperatorState::Removed {
                continue;
            }
            if node.is_sink() {
                sinks.insert(current);
            }
            queue.extend(node.downstream().iter().copied());
        }
        sinks
    }
}
