//! Placement strategies: mapping operators onto topology workers.
//!
//! An amendment walks the affected operators of a shared plan and decides,
//! per operator, which worker runs it:
//!
//! - [`bottom_up`] -- walk each source-to-sink chain upward; pin each
//!   operator on the lowest worker whose remaining slots cover the operator
//!   cost, crossing links only when capacity is exhausted.
//! - [`top_down`] -- the mirror, starting from the sink side; keeps
//!   operators as close to the sink as capacity allows.
//! - [`manual`] -- every operator carries a pinned worker; the strategy only
//!   validates.
//!
//! With incremental placement enabled, only the operators covered by
//! change-log entries are consulted; placed-and-untouched operators keep
//! their workers and their resources are not re-accounted. A placed
//! operator inside the affected region is *moved* (re-placed) only when its
//! current assignment is broken: its worker vanished or no data path to a
//! placed neighbor remains.
//!
//! State transitions on success: `ToBePlaced -> Placed`,
//! `ToBeRemoved -> Removed` (tombstoned, resources released),
//! `ToBeReplaced -> Placed` with the replacement operator already wired
//! into the DAG.

pub mod bottom_up;
pub mod manual;
pub mod top_down;

use crate::catalog::SourceCatalog;
use crate::error::PlacementError;
use crate::execution_plan::GlobalExecutionPlan;
use crate::operator::{OperatorId, OperatorKind, OperatorState};
use crate::shared_plan::{SharedPlanId, SharedQueryPlan};
use crate::topology::{Topology, WorkerId};
use crate::utils::now_micros;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Which placement strategy a shared plan uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStrategy {
    #[default]
    BottomUp,
    TopDown,
    Manual,
}

/// The resources a placement computation works against.
pub struct PlacementContext<'a> {
    pub topology: &'a mut Topology,
    pub execution_plan: &'a mut GlobalExecutionPlan,
    pub source_catalog: &'a SourceCatalog,
    /// Restrict the walk to change-log operators.
    pub incremental: bool,
}

/// What one successful placement pass did.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlacementReport {
    pub placed: usize,
    pub removed: usize,
    pub moved: usize,
    /// Change-log watermark consumed by this pass.
    pub watermark: u64,
}

/// Run the plan's placement strategy over its pending change-log entries.
///
/// Mutates the shared plan (operator states, change-log), the topology
/// (slots) and the execution plan (assignments). Callers that need
/// all-or-nothing semantics run this against clones and swap on success.
///
/// # Errors
///
/// Fails when a worker runs out of slots, a pinned worker is missing, or no
/// path exists for an operator chain; the caller keeps the change-log and
/// leaves the plan `Optimizing`.
pub fn amend_placement(
    shared: &mut SharedQueryPlan,
    ctx: &mut PlacementContext<'_>,
) -> Result<PlacementReport, PlacementError> {
    let watermark = now_micros().max(shared.change_log().last_timestamp());
    let entries: Vec<crate::changelog::ChangeLogEntry> = shared
        .change_log_entries(watermark)
        .into_iter()
        .map(|(_, e)| e.clone())
        .collect();
    if entries.is_empty() {
        return Ok(PlacementReport {
            watermark,
            ..PlacementReport::default()
        });
    }

    let region: BTreeSet<OperatorId> = if ctx.incremental {
        let mut region = BTreeSet::new();
        for entry in &entries {
            region.extend(shared.dag().region(&entry.upstream, &entry.downstream));
            region.extend(entry.operators());
        }
        region
    } else {
        shared.dag().iter().map(|n| n.id).collect()
    };

    let mut report = PlacementReport {
        watermark,
        ..PlacementReport::default()
    };
    let plan_id = shared.id();

    // Removals first: their slots become available to the rest of the pass.
    for id in &region {
        let state = shared.dag().get(*id).map(|n| n.state);
        if state == Some(OperatorState::ToBeRemoved) {
            unplace(plan_id, *id, ctx);
            if let Some(node) = shared.dag_mut().get_mut(*id) {
                node.state = OperatorState::Removed;
            }
            report.removed += 1;
        }
    }

    let strategy = shared.placement_strategy();
    let mut order: Vec<OperatorId> = shared
        .dag()
        .topo_order()
        .into_iter()
        .filter(|id| region.contains(id))
        .collect();
    if strategy == PlacementStrategy::TopDown {
        order.reverse();
    }

    for id in order {
        let Some(state) = shared.dag().get(id).map(|n| n.state) else {
            continue;
        };
        match state {
            OperatorState::Removed | OperatorState::ToBeRemoved => continue,
            OperatorState::Placed => {
                if !assignment_broken(plan_id, id, shared, ctx) {
                    continue;
                }
                unplace(plan_id, id, ctx);
                place_one(plan_id, id, strategy, shared, ctx)?;
                report.moved += 1;
            }
            OperatorState::ToBePlaced | OperatorState::ToBeReplaced => {
                unplace(plan_id, id, ctx);
                place_one(plan_id, id, strategy, shared, ctx)?;
                if let Some(node) = shared.dag_mut().get_mut(id) {
                    node.state = OperatorState::Placed;
                }
                report.placed += 1;
            }
        }
    }

    shared.change_log_mut().consume_up_to(watermark);
    debug!(
        plan = %plan_id,
        placed = report.placed,
        moved = report.moved,
        removed = report.removed,
        "placement pass complete"
    );
    Ok(report)
}

/// Release an operator's current assignment, if any.
fn unplace(plan: SharedPlanId, id: OperatorId, ctx: &mut PlacementContext<'_>) {
    if let Some((worker, cost)) = ctx.execution_plan.remove_operator(plan, id) {
        ctx.topology.release_slots(worker, cost);
    }
}

/// True if a placed operator's assignment no longer works: its worker is
/// gone or some placed neighbor became unreachable.
fn assignment_broken(
    plan: SharedPlanId,
    id: OperatorId,
    shared: &SharedQueryPlan,
    ctx: &PlacementContext<'_>,
) -> bool {
    let Some(worker) = ctx.execution_plan.worker_of(plan, id) else {
        return true;
    };
    if !ctx.topology.contains(worker) {
        return true;
    }
    let Some(node) = shared.dag().get(id) else {
        return false;
    };
    for up in node.upstream() {
        if let Some(up_worker) = ctx.execution_plan.worker_of(plan, *up) {
            if ctx.topology.find_path_between(up_worker, worker).is_none() {
                return true;
            }
        }
    }
    for down in node.downstream() {
        if let Some(down_worker) = ctx.execution_plan.worker_of(plan, *down) {
            if ctx.topology.find_path_between(worker, down_worker).is_none() {
                return true;
            }
        }
    }
    false
}

/// Select a worker via the strategy, occupy its slots, and record the
/// assignment.
fn place_one(
    plan: SharedPlanId,
    id: OperatorId,
    strategy: PlacementStrategy,
    shared: &mut SharedQueryPlan,
    ctx: &mut PlacementContext<'_>,
) -> Result<(), PlacementError> {
    let worker = match strategy {
        PlacementStrategy::BottomUp => bottom_up::select_worker(plan, id, shared, ctx)?,
        PlacementStrategy::TopDown => top_down::select_worker(plan, id, shared, ctx)?,
        PlacementStrategy::Manual => manual::select_worker(id, shared, ctx)?,
    };
    let cost = shared.dag().get(id).map_or(1, |n| n.cost);
    let available = ctx.topology.remaining_slots(worker);
    if available < cost {
        return Err(PlacementError::InsufficientCapacity {
            worker,
            operator: id,
            needed: cost,
            available,
        });
    }
    ctx.topology.occupy_slots(worker, cost)?;
    ctx.execution_plan.place_operator(plan, id, worker, cost);
    if let Some(node) = shared.dag().get(id) {
        debug!(operator = %id, kind = node.kind.label(), worker = %worker, "operator placed");
    }
    Ok(())
}

/// Resolve the fixed worker of a pinned operator, choosing and recording a
/// physical-source worker for sources on first placement.
pub(crate) fn pin_for(
    id: OperatorId,
    shared: &mut SharedQueryPlan,
    ctx: &PlacementContext<'_>,
) -> Result<Option<WorkerId>, PlacementError> {
    let (pinned, cost, source_name, is_sink) = match shared.dag().get(id) {
        Some(node) => (
            node.pinned_worker,
            node.cost,
            match &node.kind {
                OperatorKind::Source { logical_source } => Some(logical_source.clone()),
                _ => None,
            },
            node.is_sink(),
        ),
        None => return Ok(None),
    };
    if let Some(pin) = pinned {
        if !ctx.topology.contains(pin) {
            return Err(PlacementError::UnknownWorker(pin));
        }
        return Ok(Some(pin));
    }
    let chosen = if let Some(logical_source) = source_name {
        let hosts = ctx.source_catalog.workers_hosting(&logical_source);
        hosts
            .iter()
            .copied()
            .find(|w| ctx.topology.remaining_slots(*w) >= cost)
            .or_else(|| hosts.first().copied())
    } else if is_sink {
        ctx.topology.root()
    } else {
        None
    };
    if let (Some(worker), Some(node)) = (chosen, shared.dag_mut().get_mut(id)) {
        node.pinned_worker = Some(worker);
    }
    Ok(chosen)
}

/// Workers hosting the placed upstream neighbors of an operator.
pub(crate) fn upstream_anchors(
    plan: SharedPlanId,
    id: OperatorId,
    shared: &SharedQueryPlan,
    ctx: &PlacementContext<'_>,
) -> Vec<WorkerId> {
    shared
        .dag()
        .get(id)
        .map(|n| {
            n.upstream()
                .iter()
                .filter_map(|up| ctx.execution_plan.worker_of(plan, *up))
                .collect()
        })
        .unwrap_or_default()
}

/// Workers hosting the placed downstream neighbors of an operator.
pub(crate) fn downstream_anchors(
    plan: SharedPlanId,
    id: OperatorId,
    shared: &SharedQueryPlan,
    ctx: &PlacementContext<'_>,
) -> Vec<WorkerId> {
    shared
        .dag()
        .get(id)
        .map(|n| {
            n.downstream()
                .iter()
                .filter_map(|down| ctx.execution_plan.worker_of(plan, *down))
                .collect()
        })
        .unwrap_or_default()
}

/// First worker along `candidates` that is out of maintenance and has
/// capacity for the operator.
pub(crate) fn first_fitting(
    candidates: impl IntoIterator<Item = WorkerId>,
    cost: u32,
    ctx: &PlacementContext<'_>,
) -> Option<WorkerId> {
    candidates.into_iter().find(|worker| {
        ctx.topology
            .node(*worker)
            .is_some_and(|n| !n.maintenance && n.remaining_slots() >= cost)
    })
}
