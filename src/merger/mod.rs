//! Query-merger rules: fusing equivalent queries into shared plans.
//!
//! The merger is invoked by
//! [`GlobalQueryPlan::add_query_plan`](crate::global_plan::GlobalQueryPlan::add_query_plan)
//! for every candidate shared plan, in two families:
//!
//! - [`syntax`] -- exact tree isomorphism over operator DAGs with identical
//!   source sets (no signatures needed).
//! - [`signature`] -- canonical-signature comparison, either complete
//!   (full sink-to-source match) or partial (maximal common upstream
//!   sub-DAG; the merged plan shares the common region and keeps both sinks
//!   as downstream branches).
//!
//! On a merge the host plan gains a change-log entry covering the newly
//! attached region: the attachment points upstream, the new sink downstream.

pub mod signature;
pub mod syntax;

use crate::changelog::ChangeLogEntry;
use crate::config::QueryMergerRule;
use crate::error::UpdateError;
use crate::operator::OperatorId;
use crate::query_plan::QueryPlan;
use crate::shared_plan::SharedQueryPlan;
use crate::signature::SignatureInference;
use std::collections::BTreeSet;

/// Attempt to merge `incoming` into `host` under the configured rule.
///
/// Returns `Ok(true)` and mutates the host when the merge condition holds.
/// The caller has already filtered candidates by placement strategy.
///
/// # Errors
///
/// Signature-based rules fail with [`UpdateError::SignatureUnavailable`]
/// when inference cannot provide a complete signature set.
pub fn try_merge(
    rule: QueryMergerRule,
    host: &mut SharedQueryPlan,
    incoming: &QueryPlan,
    inference: &dyn SignatureInference,
) -> Result<bool, UpdateError> {
    match rule {
        QueryMergerRule::Default => Ok(false),
        QueryMergerRule::SyntaxBasedComplete => Ok(syntax::try_merge_complete(host, incoming)),
        QueryMergerRule::SignatureBasedComplete => {
            signature::try_merge_complete(host, incoming, inference)
        }
        QueryMergerRule::SignatureBasedPartial => {
            signature::try_merge_partial(host, incoming, inference)
        }
    }
}

/// Attach the incoming plan's sink below the given host operators and record
/// the hosted query plus the covering change-log entry.
pub(crate) fn attach_sink(
    host: &mut SharedQueryPlan,
    incoming: &QueryPlan,
    attach_points: &BTreeSet<OperatorId>,
) {
    let sink_id = incoming.sink();
    let sink = incoming
        .dag()
        .get(sink_id)
        .expect("incoming plan has its sink")
        .detached_clone();
    host.dag_mut().insert(sink);
    for point in attach_points {
        host.dag_mut().connect(*point, sink_id);
    }
    host.record_hosted_query(incoming.query_id(), BTreeSet::from([sink_id]));
    host.append_change_log(ChangeLogEntry::new(
        attach_points.iter().copied(),
        [sink_id],
    ));
}
