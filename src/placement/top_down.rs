//! Top-down placement: the mirror of bottom-up, starting from the sink.
//!
//! Operators are processed sink-first and anchor on the workers hosting
//! their downstream neighbors; candidates are scanned from the anchor
//! *down* toward the common ancestor of the source workers feeding the
//! operator, so heavy operators stay near the sink until capacity forces
//! them upstream-ward.

use crate::error::PlacementError;
use crate::operator::{OperatorId, OperatorKind};
use crate::shared_plan::{SharedPlanId, SharedQueryPlan};
use crate::topology::WorkerId;
use std::collections::{BTreeSet, VecDeque};

use super::{PlacementContext, downstream_anchors, first_fitting, pin_for};

/// Choose the worker for one operator.
pub(crate) fn select_worker(
    plan: SharedPlanId,
    id: OperatorId,
    shared: &mut SharedQueryPlan,
    ctx: &PlacementContext<'_>,
) -> Result<WorkerId, PlacementError> {
    if let Some(pin) = pin_for(id, shared, ctx)? {
        return Ok(pin);
    }

    let root = ctx
        .topology
        .root()
        .ok_or(PlacementError::MissingPin(id))?;
    let anchors = downstream_anchors(plan, id, shared, ctx);
    let anchor = match anchors.len() {
        0 => root,
        1 => anchors[0],
        _ => ctx.topology.find_common_ancestor(&anchors).unwrap_or(root),
    };

    // Lower bound: the common ancestor of the source workers feeding this
    // operator. The operator must sit on a path all its inputs can reach.
    let source_workers = feeding_source_workers(id, shared, ctx);
    let low = match source_workers.len() {
        0 => anchor,
        1 => source_workers[0],
        _ => ctx
            .topology
            .find_common_ancestor(&source_workers)
            .unwrap_or(anchor),
    };

    let mut path = ctx
        .topology
        .find_path_between(low, anchor)
        .ok_or(PlacementError::NoPathBetween(low, anchor))?;
    path.reverse();

    let cost = shared.dag().get(id).map_or(1, |n| n.cost);
    first_fitting(path, cost, ctx).ok_or(PlacementError::InsufficientCapacity {
        worker: anchor,
        operator: id,
        needed: cost,
        available: ctx.topology.remaining_slots(anchor),
    })
}

/// Workers hosting physical sources of every source operator upstream of
/// `id`.
fn feeding_source_workers(
    id: OperatorId,
    shared: &SharedQueryPlan,
    ctx: &PlacementContext<'_>,
) -> Vec<WorkerId> {
    let mut workers = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([id]);
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        let Some(node) = shared.dag().get(current) else {
            continue;
        };
        if let OperatorKind::Source { logical_source } = &node.kind {
            if let Some(pin) = node.pinned_worker {
                workers.insert(pin);
            } else {
                workers.extend(ctx.source_catalog.workers_hosting(logical_source));
            }
        }
        queue.extend(node.upstream().iter().copied());
    }
    workers.into_iter().collect()
}
