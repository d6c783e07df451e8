//! The global execution plan: where operators actually run.
//!
//! Maps each shared plan to the workers hosting pieces of it. An
//! [`ExecutionNode`] is a topology node viewed through the lens of the
//! sub-plans it currently hosts; a [`SubPlan`] is one group of co-located,
//! connected operators of a single shared plan together with the slots they
//! occupy.
//!
//! Slot accounting itself lives on the topology nodes (the only shared
//! mutable resource the placement strategies write); this structure records
//! assignments and answers reverse lookups (which plans touch a worker,
//! which worker hosts an operator) that topology-change impact analysis
//! needs.

use crate::operator::{OperatorDag, OperatorId};
use crate::shared_plan::{SharedPlanId, SharedQueryPlan};
use crate::topology::WorkerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A group of co-located, connected operators of one shared plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPlan {
    pub operators: BTreeSet<OperatorId>,
    pub occupied_slots: u32,
}

/// One worker's share of the execution plan.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionNode {
    /// Assigned operators (with slot cost) per shared plan.
    assigned: BTreeMap<SharedPlanId, BTreeMap<OperatorId, u32>>,
}

impl ExecutionNode {
    /// Operators of one shared plan on this worker.
    #[must_use]
    pub fn operators_of(&self, plan: SharedPlanId) -> Vec<OperatorId> {
        self.assigned
            .get(&plan)
            .map(|ops| ops.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Shared plans with at least one operator here.
    #[must_use]
    pub fn plans(&self) -> Vec<SharedPlanId> {
        self.assigned.keys().copied().collect()
    }

    /// Group this worker's operators of `plan` into connected sub-plans,
    /// using the plan's DAG for adjacency.
    #[must_use]
    pub fn sub_plans(&self, plan: SharedPlanId, dag: &OperatorDag) -> Vec<SubPlan> {
        let Some(ops) = self.assigned.get(&plan) else {
            return Vec::new();
        };
        let here: BTreeSet<OperatorId> = ops.keys().copied().collect();
        let mut remaining = here.clone();
        let mut groups = Vec::new();
        while let Some(seed) = remaining.iter().next().copied() {
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([seed]);
            while let Some(current) = queue.pop_front() {
                if !remaining.remove(&current) {
                    continue;
                }
                component.insert(current);
                if let Some(node) = dag.get(current) {
                    for neighbor in node.upstream().iter().chain(node.downstream()) {
                        if remaining.contains(neighbor) {
                            queue.push_back(*neighbor);
                        }
                    }
                }
            }
            let occupied_slots = component.iter().filter_map(|id| ops.get(id)).sum();
            groups.push(SubPlan {
                operators: component,
                occupied_slots,
            });
        }
        groups
    }
}

/// Serializable deployment view of one shared plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploySummary {
    pub plan_id: SharedPlanId,
    pub status: String,
    pub pending_change_log_entries: usize,
    /// Worker id -> sub-plans of this shared plan hosted there.
    pub placements: BTreeMap<u64, Vec<SubPlan>>,
}

/// Mapping shared-plan id to per-worker sub-plans, with reverse lookups.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalExecutionPlan {
    nodes: BTreeMap<WorkerId, ExecutionNode>,
    locations: BTreeMap<(SharedPlanId, OperatorId), WorkerId>,
}

impl GlobalExecutionPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operator assignment. A previous assignment of the same
    /// operator is replaced (the caller releases its slots).
    pub fn place_operator(
        &mut self,
        plan: SharedPlanId,
        operator: OperatorId,
        worker: WorkerId,
        cost: u32,
    ) {
        if let Some(previous) = self.locations.insert((plan, operator), worker) {
            if let Some(node) = self.nodes.get_mut(&previous) {
                node.assigned.entry(plan).or_default().remove(&operator);
            }
        }
        self.nodes
            .entry(worker)
            .or_default()
            .assigned
            .entry(plan)
            .or_default()
            .insert(operator, cost);
    }

    /// Remove an operator assignment, returning its worker and slot cost so
    /// the caller can release the slots.
    pub fn remove_operator(
        &mut self,
        plan: SharedPlanId,
        operator: OperatorId,
    ) -> Option<(WorkerId, u32)> {
        let worker = self.locations.remove(&(plan, operator))?;
        let node = self.nodes.get_mut(&worker)?;
        let cost = node
            .assigned
            .get_mut(&plan)
            .and_then(|ops| ops.remove(&operator))
            .unwrap_or(0);
        if node.assigned.get(&plan).is_some_and(BTreeMap::is_empty) {
            node.assigned.remove(&plan);
        }
        Some((worker, cost))
    }

    /// The worker hosting an operator, if placed.
    #[must_use]
    pub fn worker_of(&self, plan: SharedPlanId, operator: OperatorId) -> Option<WorkerId> {
        self.locations.get(&(plan, operator)).copied()
    }

    #[must_use]
    pub fn node(&self, worker: WorkerId) -> Option<&ExecutionNode> {
        self.nodes.get(&worker)
    }

    /// Shared plans with at least one operator on the worker.
    #[must_use]
    pub fn plans_on(&self, worker: WorkerId) -> Vec<SharedPlanId> {
        self.nodes.get(&worker).map(ExecutionNode::plans).unwrap_or_default()
    }

    /// All placed operators of one shared plan with their workers.
    #[must_use]
    pub fn placements_of(&self, plan: SharedPlanId) -> Vec<(OperatorId, WorkerId)> {
        self.locations
            .iter()
            .filter(|((p, _), _)| *p == plan)
            .map(|((_, op), worker)| (*op, *worker))
            .collect()
    }

    /// Drop every assignment on a removed worker. Returns the dropped
    /// (plan, operator, cost) triples; their slots vanished with the node.
    pub fn remove_worker(&mut self, worker: WorkerId) -> Vec<(SharedPlanId, OperatorId, u32)> {
        let Some(node) = self.nodes.remove(&worker) else {
            return Vec::new();
        };
        let mut dropped = Vec::new();
        for (plan, ops) in node.assigned {
            for (op, cost) in ops {
                self.locations.remove(&(plan, op));
                dropped.push((plan, op, cost));
            }
        }
        dropped
    }

    /// Drop every assignment of one shared plan. Returns (worker, cost)
    /// pairs so the caller can release the slots.
    pub fn remove_plan(&mut self, plan: SharedPlanId) -> Vec<(WorkerId, u32)> {
        let mut released = Vec::new();
        self.locations.retain(|(p, _), _| *p != plan);
        for (worker, node) in &mut self.nodes {
            if let Some(ops) = node.assigned.remove(&plan) {
                for cost in ops.values() {
                    released.push((*worker, *cost));
                }
            }
        }
        released
    }

    /// Build the serializable deployment view of one shared plan.
    #[must_use]
    pub fn deploy_summary(&self, shared: &SharedQueryPlan) -> DeploySummary {
        let plan_id = shared.id();
        let mut placements = BTreeMap::new();
        for (worker, node) in &self.nodes {
            let sub_plans = node.sub_plans(plan_id, shared.dag());
            if !sub_plans.is_empty() {
                placements.insert(worker.raw(), sub_plans);
            }
        }
        DeploySummary {
            plan_id,
            status: format!("{:?}", shared.status()),
            pending_change_log_entries: shared.change_log().len(),
            placements,
        }
    }
}
