//! The global query plan: a forest of shared query plans.
//!
//! The [`GlobalQueryPlan`] keys shared plans by id and maintains the
//! query-id index. Invariants:
//! - every hosted query id maps to exactly one shared plan;
//! - every shared plan hosts at least one query id, or its status is
//!   `Stopped`/`Failed` and it awaits garbage collection.
//!
//! New query plans enter through [`GlobalQueryPlan::add_query_plan`], which
//! consults the configured merger rule: the first candidate shared plan that
//! satisfies the merge condition absorbs the query, otherwise a fresh shared
//! plan is created. Candidates with a different placement strategy are never
//! considered.

use crate::config::QueryMergerRule;
use crate::error::UpdateError;
use crate::merger;
use crate::placement::PlacementStrategy;
use crate::query_plan::{QueryId, QueryPlan};
use crate::shared_plan::{SharedPlanId, SharedQueryPlan, SharedQueryPlanStatus};
use crate::signature::SignatureInference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Forest of shared query plans plus the query-id index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalQueryPlan {
    shared_plans: BTreeMap<SharedPlanId, SharedQueryPlan>,
    query_index: BTreeMap<QueryId, SharedPlanId>,
    next_plan_id: u64,
}

impl GlobalQueryPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a new query plan, merging it into an existing shared plan when
    /// the configured rule allows, creating a new shared plan otherwise.
    ///
    /// # Errors
    ///
    /// Fails when the query id is already hosted, or when a signature-based
    /// rule cannot obtain signatures.
    pub fn add_query_plan(
        &mut self,
        plan: QueryPlan,
        strategy: PlacementStrategy,
        rule: QueryMergerRule,
        inference: &dyn SignatureInference,
    ) -> Result<SharedPlanId, UpdateError> {
        let query_id = plan.query_id();
        if self.query_index.contains_key(&query_id) {
            return Err(UpdateError::DuplicateQueryInBatch(query_id));
        }

        let candidates: Vec<SharedPlanId> = self
            .shared_plans
            .values()
            .filter(|p| {
                p.placement_strategy() == strategy
                    && !matches!(
                        p.status(),
                        SharedQueryPlanStatus::Stopped | SharedQueryPlanStatus::Failed
                    )
            })
            .map(SharedQueryPlan::id)
            .collect();

        for candidate in candidates {
            let host = self
                .shared_plans
                .get_mut(&candidate)
                .expect("candidate id from the forest");
            if merger::try_merge(rule, host, &plan, inference)? {
                debug!(query = %query_id, shared_plan = %candidate, "merged query into shared plan");
                self.query_index.insert(query_id, candidate);
                return Ok(candidate);
            }
        }

        self.next_plan_id += 1;
        let id = SharedPlanId::new(self.next_plan_id);
        let shared = SharedQueryPlan::from_query(id, plan, strategy);
        debug!(query = %query_id, shared_plan = %id, "created new shared plan");
        self.shared_plans.insert(id, shared);
        self.query_index.insert(query_id, id);
        Ok(id)
    }

    /// The shared plan hosting a query, if any.
    #[must_use]
    pub fn shared_plan_for_query(&self, query_id: QueryId) -> Option<SharedPlanId> {
        self.query_index.get(&query_id).copied()
    }

    /// Shared plans the deployment layer must pick up: non-empty change-log
    /// or terminally stopped.
    #[must_use]
    pub fn shared_plans_to_deploy(&self) -> Vec<SharedPlanId> {
        self.shared_plans
            .values()
            .filter(|p| p.needs_deployment())
            .map(SharedQueryPlan::id)
            .collect()
    }

    /// Garbage-collect terminal shared plans (`Stopped` or `Failed`) and the
    /// index entries of the queries they hosted.
    pub fn remove_failed_or_stopped(&mut self) {
        let terminal: Vec<SharedPlanId> = self
            .shared_plans
            .values()
            .filter(|p| {
                matches!(
                    p.status(),
                    SharedQueryPlanStatus::Stopped | SharedQueryPlanStatus::Failed
                )
            })
            .map(SharedQueryPlan::id)
            .collect();
        for id in terminal {
            self.shared_plans.remove(&id);
            self.query_index.retain(|_, plan| *plan != id);
        }
    }

    /// Drop the index entry of a stopped query. The hosting shared plan
    /// keeps its change-log so the stop amendment can still run.
    pub fn unindex_query(&mut self, query_id: QueryId) {
        self.query_index.remove(&query_id);
    }

    /// Install an amended shared plan, replacing the previous version.
    /// Used by the amenders when committing a placement pass computed on a
    /// clone.
    pub fn install_plan(&mut self, plan: SharedQueryPlan) {
        self.shared_plans.insert(plan.id(), plan);
    }

    #[must_use]
    pub fn plan(&self, id: SharedPlanId) -> Option<&SharedQueryPlan> {
        self.shared_plans.get(&id)
    }

    #[must_use]
    pub fn plan_mut(&mut self, id: SharedPlanId) -> Option<&mut SharedQueryPlan> {
        self.shared_plans.get_mut(&id)
    }

    /// All shared plans, in id order.
    pub fn plans(&self) -> impl Iterator<Item = &SharedQueryPlan> {
        self.shared_plans.values()
    }

    pub fn plans_mut(&mut self) -> impl Iterator<Item = &mut SharedQueryPlan> {
        self.shared_plans.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared_plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared_plans.is_empty()
    }
}
