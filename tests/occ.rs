use anyhow::Result;
use fluxmesh::testing::{TestSourceCatalogBuilder, TestTopologyBuilder, test_config, test_schema};
use fluxmesh::{
    AddQueryRequest, ArithmeticOp, CoordinatorConfig, CoordinatorState, MapExpr,
    PlacementAmendmentHandler, PlacementAmendmentMode, PlacementStrategy, Predicate, Query, QueryId,
    QueryState, Request, SharedQueryPlanStatus, SinkDescriptor, UpdatePhase,
};
use mark_flaky_tests::flaky;

/// Four queries compete for a choke worker with four slots (two slots
/// needed each) and a root with exactly four (one sink each). Two queries
/// fit; two must fail and stay `Optimizing`.
fn contended_state() -> CoordinatorState {
    let topology = TestTopologyBuilder::new()
        .root(1, 4)
        .child(2, 1, 4)
        .child(3, 2, 1)
        .child(4, 2, 1)
        .child(5, 2, 1)
        .child(6, 2, 1)
        .build();
    let catalog = TestSourceCatalogBuilder::new()
        .source("s1", test_schema(), 3)
        .source("s2", test_schema(), 4)
        .source("s3", test_schema(), 5)
        .source("s4", test_schema(), 6)
        .build();
    CoordinatorState::new(topology, catalog)
}

fn competing_query(id: u64, source: &str) -> Request {
    // Source (1 slot on its own worker), filter + map (2 slots on the choke
    // worker), sink (1 slot on the root).
    let plan = Query::from(source)
        .filter(Predicate::Gt("f1".into(), 0))
        .map(MapExpr {
            output_field: "f3".into(),
            input_field: "f1".into(),
            op: ArithmeticOp::Mul,
            operand: 2,
        })
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(id));
    Request::AddQuery(AddQueryRequest::new(plan, PlacementStrategy::BottomUp))
}

#[flaky]
#[test]
fn contending_amendments_commit_up_to_capacity() -> Result<()> {
    let state = contended_state();
    let config = CoordinatorConfig {
        placement_amendment_mode: PlacementAmendmentMode::Optimistic,
        placement_amendment_thread_count: 4,
        // Conflicts are bounded by the number of commits; a generous budget
        // keeps capacity the only reason to fail.
        occ_retry_count: 10,
        ..test_config()
    };
    let phase = UpdatePhase::new(state.clone(), config.clone());

    let instances = phase.execute(vec![
        competing_query(1, "s1"),
        competing_query(2, "s2"),
        competing_query(3, "s3"),
        competing_query(4, "s4"),
    ])?;
    assert_eq!(instances.len(), 4);

    let mut handler = PlacementAmendmentHandler::new(4, state.clone(), config);
    handler.start();
    for instance in instances {
        handler.enqueue(instance)?;
    }
    handler.await_idle();
    handler.shut_down();

    let global = state.read_global_query_plan();
    let still_dirty = global.shared_plans_to_deploy();
    assert_eq!(still_dirty.len(), 2, "exactly two plans fit the capacity");

    let mut running = 0;
    let mut optimizing = 0;
    for plan in global.plans() {
        match plan.status() {
            SharedQueryPlanStatus::Deployed => running += 1,
            SharedQueryPlanStatus::Optimizing => {
                optimizing += 1;
                // The losers keep their change-logs for a later retry.
                assert!(!plan.change_log().is_empty());
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!(running, 2);
    assert_eq!(optimizing, 2);

    let catalog = state.read_query_catalog();
    let states: Vec<QueryState> = [1, 2, 3, 4]
        .into_iter()
        .filter_map(|id| catalog.state_of(QueryId::new(id)))
        .collect();
    assert_eq!(
        states.iter().filter(|s| **s == QueryState::Running).count(),
        2
    );
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == QueryState::Optimizing)
            .count(),
        2
    );
    Ok(())
}

#[test]
fn an_uncontended_optimistic_amendment_commits_first_try() -> Result<()> {
    let state = contended_state();
    let config = CoordinatorConfig {
        placement_amendment_mode: PlacementAmendmentMode::Optimistic,
        ..test_config()
    };
    let phase = UpdatePhase::new(state.clone(), config.clone());

    let instances = phase.execute(vec![competing_query(1, "s1")])?;
    let mut handler = PlacementAmendmentHandler::new(2, state.clone(), config);
    handler.start();
    for instance in instances {
        handler.enqueue(instance)?;
    }
    handler.await_idle();
    handler.shut_down();

    let global = state.read_global_query_plan();
    assert!(global.shared_plans_to_deploy().is_empty());
    let plan_id = global.shared_plan_for_query(QueryId::new(1)).unwrap();
    assert_eq!(
        global.plan(plan_id).unwrap().status(),
        SharedQueryPlanStatus::Deployed
    );
    Ok(())
}
