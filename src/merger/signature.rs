//! Signature-based merging: complete and partial.
//!
//! Each operator exports a canonical logical signature (derived by the
//! signature-inference collaborator). Two plans merge *completely* when the
//! frontiers feeding their sinks carry identical signature multisets, and
//! *partially* when a maximal common upstream sub-DAG exists -- the merged
//! plan then shares the common region and keeps both sinks as downstream
//! branches.
//!
//! A failed inference is surfaced as
//! [`UpdateError::SignatureUnavailable`]; the rule never silently falls
//! back to syntax matching.

use crate::changelog::ChangeLogEntry;
use crate::error::UpdateError;
use crate::operator::OperatorId;
use crate::query_plan::QueryPlan;
use crate::shared_plan::SharedQueryPlan;
use crate::signature::{SignatureInference, SignatureMap};
use std::collections::{BTreeMap, BTreeSet};

/// Try a complete signature-based merge of `incoming` into `host`.
///
/// # Errors
///
/// Fails when signature inference cannot cover the incoming plan
/// (`SignatureUnavailable`) or the host plan (`MergerFailure`).
pub fn try_merge_complete(
    host: &mut SharedQueryPlan,
    incoming: &QueryPlan,
    inference: &dyn SignatureInference,
) -> Result<bool, UpdateError> {
    let (incoming_sigs, host_sigs) = infer_both(host, incoming, inference)?;

    let incoming_frontier: Vec<OperatorId> = incoming
        .dag()
        .get(incoming.sink())
        .map(|n| n.upstream().iter().copied().collect())
        .unwrap_or_default();

    for host_sink in host.dag().sinks() {
        let host_frontier: Vec<OperatorId> = host
            .dag()
            .get(host_sink)
            .map(|n| n.upstream().iter().copied().collect())
            .unwrap_or_default();
        if let Some(attach_points) =
            pair_by_signature(&host_frontier, &host_sigs, &incoming_frontier, &incoming_sigs)
        {
            super::attach_sink(host, incoming, &attach_points);
            return Ok(true);
        }
    }
    Ok(false)
}

/// Try a partial signature-based merge: share the maximal common upstream
/// sub-DAG and attach the incoming plan's unmatched branch.
///
/// # Errors
///
/// Same failure modes as [`try_merge_complete`].
pub fn try_merge_partial(
    host: &mut SharedQueryPlan,
    incoming: &QueryPlan,
    inference: &dyn SignatureInference,
) -> Result<bool, UpdateError> {
    let (incoming_sigs, host_sigs) = infer_both(host, incoming, inference)?;

    // Signature equality implies an identical upstream subtree, so a single
    // bottom-up pass finds the maximal common region.
    let mut by_sig: BTreeMap<&str, OperatorId> = BTreeMap::new();
    for (host_id, sig) in &host_sigs {
        by_sig.entry(sig.as_str()).or_insert(*host_id);
    }
    let mut mapping: BTreeMap<OperatorId, OperatorId> = BTreeMap::new();
    for (incoming_id, sig) in &incoming_sigs {
        if *incoming_id == incoming.sink() {
            continue;
        }
        if let Some(host_id) = by_sig.get(sig.as_str()) {
            mapping.insert(*incoming_id, *host_id);
        }
    }
    if mapping.is_empty() {
        return Ok(false);
    }

    // Transplant the unmatched branch, rewiring edges that cross the
    // matched frontier onto the host counterparts.
    let unmatched: Vec<OperatorId> = incoming
        .dag()
        .iter()
        .map(|n| n.id)
        .filter(|id| !mapping.contains_key(id))
        .collect();
    for id in &unmatched {
        let node = incoming
            .dag()
            .get(*id)
            .expect("unmatched id from incoming dag")
            .detached_clone();
        host.dag_mut().insert(node);
    }
    let mut frontier = BTreeSet::new();
    for id in &unmatched {
        let upstream: Vec<OperatorId> = incoming
            .dag()
            .get(*id)
            .map(|n| n.upstream().iter().copied().collect())
            .unwrap_or_default();
        for up in upstream {
            match mapping.get(&up) {
                Some(host_up) => {
                    frontier.insert(*host_up);
                    host.dag_mut().connect(*host_up, *id);
                }
                None => host.dag_mut().connect(up, *id),
            }
        }
    }

    let sink_id = incoming.sink();
    host.record_hosted_query(incoming.query_id(), BTreeSet::from([sink_id]));
    host.append_change_log(ChangeLogEntry::new(frontier, [sink_id]));
    Ok(true)
}

fn infer_both(
    host: &SharedQueryPlan,
    incoming: &QueryPlan,
    inference: &dyn SignatureInference,
) -> Result<(SignatureMap, SignatureMap), UpdateError> {
    let incoming_sigs =
        inference
            .infer(incoming.dag())
            .map_err(|e| UpdateError::SignatureUnavailable {
                query_id: incoming.query_id(),
                reason: e.to_string(),
            })?;
    let host_sigs = inference
        .infer(host.dag())
        .map_err(|e| UpdateError::MergerFailure(e.to_string()))?;
    Ok((incoming_sigs, host_sigs))
}

/// Pair each incoming frontier operator with a distinct host frontier
/// operator of identical signature. Returns the host side on success.
fn pair_by_signature(
    host_frontier: &[OperatorId],
    host_sigs: &SignatureMap,
    incoming_frontier: &[OperatorId],
    incoming_sigs: &SignatureMap,
) -> Option<BTreeSet<OperatorId>> {
    if host_frontier.len() != incoming_frontier.len() {
        return None;
    }
    let mut available: Vec<OperatorId> = host_frontier.to_vec();
    let mut attach = BTreeSet::new();
    for incoming_id in incoming_frontier {
        let want = incoming_sigs.get(incoming_id)?;
        let pos = available
            .iter()
            .position(|host_id| host_sigs.get(host_id) == Some(want))?;
        attach.insert(available.swap_remove(pos));
    }
    Some(attach)
}
