//! Assertion functions for coordinator state.
//!
//! These compare shared-plan internals with expected shapes and panic with
//! detailed messages on mismatch, so test failures point at the divergence
//! instead of a bare boolean.

use crate::changelog::ChangeLogEntry;
use crate::operator::{OperatorId, OperatorState};
use crate::query_plan::QueryId;
use crate::shared_plan::SharedQueryPlan;
use std::collections::BTreeSet;

/// Assert that every listed operator of the plan is in `expected`.
///
/// # Panics
///
/// Panics when an operator is missing or in a different state.
pub fn assert_operator_states(
    plan: &SharedQueryPlan,
    operators: impl IntoIterator<Item = OperatorId>,
    expected: OperatorState,
) {
    for id in operators {
        let actual = plan
            .dag()
            .get(id)
            .unwrap_or_else(|| panic!("operator {id} not in shared plan {}", plan.id()))
            .state;
        assert_eq!(
            actual, expected,
            "operator {id} in {:?}, expected {:?}",
            actual, expected
        );
    }
}

/// Assert the boundary sizes of a change-log entry.
///
/// # Panics
///
/// Panics when either boundary has a different cardinality.
pub fn assert_entry_boundaries(entry: &ChangeLogEntry, upstream: usize, downstream: usize) {
    assert_eq!(
        entry.upstream.len(),
        upstream,
        "upstream boundary is {:?}, expected {upstream} operators",
        entry.upstream
    );
    assert_eq!(
        entry.downstream.len(),
        downstream,
        "downstream boundary is {:?}, expected {downstream} operators",
        entry.downstream
    );
}

/// Assert the exact hosted-query set of a shared plan.
///
/// # Panics
///
/// Panics when the hosted set differs.
pub fn assert_hosted_queries(plan: &SharedQueryPlan, expected: &[QueryId]) {
    let actual: BTreeSet<QueryId> = plan.hosted_query_ids().into_iter().collect();
    let expected: BTreeSet<QueryId> = expected.iter().copied().collect();
    assert_eq!(
        actual, expected,
        "shared plan {} hosts {actual:?}, expected {expected:?}",
        plan.id()
    );
}

/// Assert that the plan has exactly `count` pending change-log entries now.
///
/// # Panics
///
/// Panics when the pending-entry count differs.
pub fn assert_pending_entries(plan: &SharedQueryPlan, count: usize) {
    let entries = plan.change_log_entries(crate::utils::now_micros());
    assert_eq!(
        entries.len(),
        count,
        "shared plan {} has {} pending change-log entries, expected {count}",
        plan.id(),
        entries.len()
    );
}
