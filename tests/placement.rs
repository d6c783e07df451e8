use anyhow::Result;
use fluxmesh::testing::{
    TestSourceCatalogBuilder, TestTopologyBuilder, coordinator_state, test_config, test_schema,
};
use fluxmesh::{
    AddQueryRequest, CoordinatorConfig, CoordinatorState, OperatorKind, PlacementAmendmentHandler,
    PlacementStrategy, Predicate, Query, QueryId, QueryPlan, Request, SharedQueryPlanStatus,
    SinkDescriptor, UpdatePhase, WorkerId,
};

fn deploy_one(state: &CoordinatorState, config: &CoordinatorConfig, request: Request) -> Result<()> {
    let phase = UpdatePhase::new(state.clone(), config.clone());
    let instances = phase.execute(vec![request])?;
    let mut handler = PlacementAmendmentHandler::new(2, state.clone(), config.clone());
    handler.start();
    for instance in instances {
        handler.enqueue(instance)?;
    }
    handler.await_idle();
    handler.shut_down();
    Ok(())
}

fn filter_query(id: u64) -> QueryPlan {
    Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 0))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(id))
}

fn filter_of(state: &CoordinatorState, query: QueryId) -> (fluxmesh::SharedPlanId, Option<WorkerId>) {
    let global = state.read_global_query_plan();
    let plan_id = global.shared_plan_for_query(query).unwrap();
    let shared = global.plan(plan_id).unwrap();
    let filter = shared
        .dag()
        .iter()
        .find(|n| matches!(n.kind, OperatorKind::Filter { .. }))
        .unwrap()
        .id;
    let worker = state.read_global_execution_plan().worker_of(plan_id, filter);
    (plan_id, worker)
}

#[test]
fn bottom_up_keeps_operators_near_the_sources() -> Result<()> {
    let state = coordinator_state();
    let config = test_config();
    deploy_one(
        &state,
        &config,
        Request::AddQuery(AddQueryRequest::new(
            filter_query(1),
            PlacementStrategy::BottomUp,
        )),
    )?;

    // Worker 5 has a spare slot next to the source; bottom-up uses it.
    let (_, worker) = filter_of(&state, QueryId::new(1));
    assert_eq!(worker, Some(WorkerId::new(5)));
    Ok(())
}

#[test]
fn top_down_keeps_operators_near_the_sink() -> Result<()> {
    let state = coordinator_state();
    let config = test_config();
    deploy_one(
        &state,
        &config,
        Request::AddQuery(AddQueryRequest::new(
            filter_query(1),
            PlacementStrategy::TopDown,
        )),
    )?;

    let (_, worker) = filter_of(&state, QueryId::new(1));
    assert_eq!(worker, Some(WorkerId::new(1)), "filter packs onto the root");
    Ok(())
}

#[test]
fn maintenance_workers_are_skipped() -> Result<()> {
    // Worker 5 is full after the source; 3 is under maintenance, so the
    // filter must climb past it to worker 2.
    let topology = TestTopologyBuilder::new()
        .root(1, 100)
        .child(2, 1, 100)
        .child(3, 2, 10)
        .child(5, 3, 1)
        .maintenance(3)
        .build();
    let catalog = TestSourceCatalogBuilder::new()
        .source("source1", test_schema(), 5)
        .build();
    let state = CoordinatorState::new(topology, catalog);
    let config = test_config();

    deploy_one(
        &state,
        &config,
        Request::AddQuery(AddQueryRequest::new(
            filter_query(1),
            PlacementStrategy::BottomUp,
        )),
    )?;

    let (_, worker) = filter_of(&state, QueryId::new(1));
    assert_eq!(worker, Some(WorkerId::new(2)));
    Ok(())
}

#[test]
fn manual_placement_honors_pins() -> Result<()> {
    let state = coordinator_state();
    let config = test_config();

    let mut plan = filter_query(1);
    let filter = plan
        .dag()
        .iter()
        .find(|n| matches!(n.kind, OperatorKind::Filter { .. }))
        .unwrap()
        .id;
    plan.dag_mut().get_mut(filter).unwrap().pinned_worker = Some(WorkerId::new(4));

    deploy_one(
        &state,
        &config,
        Request::AddQuery(AddQueryRequest::new(plan, PlacementStrategy::Manual)),
    )?;

    let (plan_id, worker) = filter_of(&state, QueryId::new(1));
    assert_eq!(worker, Some(WorkerId::new(4)));
    let global = state.read_global_query_plan();
    assert_eq!(
        global.plan(plan_id).unwrap().status(),
        SharedQueryPlanStatus::Deployed
    );
    Ok(())
}

#[test]
fn manual_placement_without_a_pin_parks_the_plan() -> Result<()> {
    let state = coordinator_state();
    let config = test_config();

    // The filter carries no pin; sources and sinks derive theirs.
    deploy_one(
        &state,
        &config,
        Request::AddQuery(AddQueryRequest::new(
            filter_query(1),
            PlacementStrategy::Manual,
        )),
    )?;

    let global = state.read_global_query_plan();
    let plan_id = global.shared_plan_for_query(QueryId::new(1)).unwrap();
    let shared = global.plan(plan_id).unwrap();
    assert_eq!(shared.status(), SharedQueryPlanStatus::Optimizing);
    assert!(!shared.change_log().is_empty(), "change-log kept for retry");
    Ok(())
}
