//! Syntax-based complete merging: exact tree isomorphism.
//!
//! Two plans merge when their operator DAGs below the sinks are isomorphic
//! under exact attribute and predicate matching, and both read the identical
//! set of logical sources. The sink operators themselves are excluded from
//! the comparison; a merge attaches the incoming sink to the host operators
//! matched against the incoming sink's upstream frontier.

use crate::operator::{OperatorDag, OperatorId, OperatorState};
use crate::query_plan::QueryPlan;
use crate::shared_plan::SharedQueryPlan;
use std::collections::BTreeSet;

/// Try a complete syntax-based merge of `incoming` into `host`.
pub fn try_merge_complete(host: &mut SharedQueryPlan, incoming: &QueryPlan) -> bool {
    let host_sources: BTreeSet<String> = source_names(host.dag());
    if host_sources != incoming.source_names() {
        return false;
    }

    let incoming_frontier: Vec<OperatorId> = incoming
        .dag()
        .get(incoming.sink())
        .map(|n| n.upstream().iter().copied().collect())
        .unwrap_or_default();

    // Any one host sink whose upstream frontier matches proves equivalence;
    // all sinks of a shared plan hang off the same fused body.
    for host_sink in host.dag().sinks() {
        let host_frontier: Vec<OperatorId> = host
            .dag()
            .get(host_sink)
            .map(|n| n.upstream().iter().copied().collect())
            .unwrap_or_default();
        if let Some(mapping) =
            match_frontiers(host.dag(), &host_frontier, incoming.dag(), &incoming_frontier)
        {
            let attach_points: BTreeSet<OperatorId> = mapping.into_iter().collect();
            super::attach_sink(host, incoming, &attach_points);
            return true;
        }
    }
    false
}

fn source_names(dag: &OperatorDag) -> BTreeSet<String> {
    dag.iter()
        .filter_map(|n| match &n.kind {
            crate::operator::OperatorKind::Source { logical_source } => {
                Some(logical_source.clone())
            }
            _ => None,
        })
        .collect()
}

/// Match two operator frontiers as multisets, returning the host operators
/// used (in incoming-frontier order) when every pairing is isomorphic.
fn match_frontiers(
    host_dag: &OperatorDag,
    host_frontier: &[OperatorId],
    incoming_dag: &OperatorDag,
    incoming_frontier: &[OperatorId],
) -> Option<Vec<OperatorId>> {
    if host_frontier.len() != incoming_frontier.len() {
        return None;
    }
    let mut used = vec![false; host_frontier.len()];
    let mut mapping = Vec::with_capacity(incoming_frontier.len());
    if assign(
        host_dag,
        host_frontier,
        incoming_dag,
        incoming_frontier,
        0,
        &mut used,
        &mut mapping,
    ) {
        Some(mapping)
    } else {
        None
    }
}

fn assign(
    host_dag: &OperatorDag,
    host_frontier: &[OperatorId],
    incoming_dag: &OperatorDag,
    incoming_frontier: &[OperatorId],
    index: usize,
    used: &mut [bool],
    mapping: &mut Vec<OperatorId>,
) -> bool {
    if index == incoming_frontier.len() {
        return true;
    }
    for (slot, candidate) in host_frontier.iter().enumerate() {
        if used[slot] || !isomorphic(host_dag, *candidate, incoming_dag, incoming_frontier[index]) {
            continue;
        }
        used[slot] = true;
        mapping.push(*candidate);
        if assign(
            host_dag,
            host_frontier,
            incoming_dag,
            incoming_frontier,
            index + 1,
            used,
            mapping,
        ) {
            return true;
        }
        mapping.pop();
        used[slot] = false;
    }
    false
}

/// Exact recursive isomorphism of the sub-DAGs rooted at the two operators.
fn isomorphic(
    host_dag: &OperatorDag,
    host_id: OperatorId,
    incoming_dag: &OperatorDag,
    incoming_id: OperatorId,
) -> bool {
    let (Some(host_op), Some(incoming_op)) = (host_dag.get(host_id), incoming_dag.get(incoming_id))
    else {
        return false;
    };
    if host_op.state == OperatorState::Removed || host_op.kind != incoming_op.kind {
        return false;
    }
    let host_children: Vec<OperatorId> = host_op.upstream().iter().copied().collect();
    let incoming_children: Vec<OperatorId> = incoming_op.upstream().iter().copied().collect();
    match_frontiers(host_dag, &host_children, incoming_dag, &incoming_children).is_some()
}
