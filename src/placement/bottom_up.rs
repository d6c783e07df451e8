//! Bottom-up placement: operators stay as close to the sources as capacity
//! allows.
//!
//! Each operator anchors on the workers hosting its upstream neighbors
//! (their common ancestor when there are several) and climbs toward the
//! root, settling on the first worker with enough free slots. Pinned
//! operators (sources, sinks, manual pins) go where their pin says.

use crate::error::PlacementError;
use crate::operator::OperatorId;
use crate::shared_plan::{SharedPlanId, SharedQueryPlan};
use crate::topology::WorkerId;

use super::{PlacementContext, first_fitting, pin_for, upstream_anchors};

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

    let anchors = upstream_anchors(plan, id, shared, ctx);
    let root = ctx
        .topology
        .root()
        .ok_or(PlacementError::MissingPin(id))?;
    let base = match anchors.len() {
        0 => root,
        1 => anchors[0],
        _ => ctx.topology.find_common_ancestor(&anchors).unwrap_or(root),
    };
    let path = ctx
        .topology
        .find_path_between(base, root)
        .ok_or(PlacementError::NoPathBetween(base, root))?;

    let cost = shared.dag().get(id).map_or(1, |n| n.cost);
    first_fitting(path, cost, ctx).ok_or(PlacementError::InsufficientCapacity {
        worker: base,
        operator: id,
        needed: cost,
        available: ctx.topology.remaining_slots(base),
    })
}
