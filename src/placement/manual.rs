//! Manual placement: every operator carries a pinned worker; the strategy
//! only validates that the pin exists. Capacity is checked by the shared
//! placement pass like for any other strategy.

use crate::error::PlacementError;
use crate::operator::OperatorId;
use crate::shared_plan::SharedQueryPlan;
use crate::topology::WorkerId;

use super::{PlacementContext, pin_for};

/// Return the operator's pinned worker.
pub(crate) fn select_worker(
    id: OperatorId,
    shared: &mut SharedQueryPlan,
    ctx: &PlacementContext<'_>,
) -> Result<WorkerId, PlacementError> {
    pin_for(id, shared, ctx)?.ok_or(PlacementError::MissingPin(id))
}
