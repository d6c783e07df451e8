use anyhow::Result;
use fluxmesh::testing::{assert_hosted_queries, coordinator_state, test_config};
use fluxmesh::{
    AddQueryRequest, CoordinatorConfig, CoordinatorState, OperatorState, PlacementAmendmentHandler,
    PlacementStrategy, Query, QueryId, QueryMergerRule, QueryState, Request, ResourceId,
    SharedQueryPlanStatus, SinkDescriptor, StopQueryRequest, StorageError,
    TwoPhaseLockingStorageHandler, UpdatePhase, WorkerId,
};
use std::time::Duration;

fn source1_query(id: u64) -> fluxmesh::QueryPlan {
    Query::from("source1")
        .sink(SinkDescriptor::Print)
        .with_query_id(QueryId::new(id))
}

fn run_and_deploy(
    state: &CoordinatorState,
    config: &CoordinatorConfig,
    phase: &UpdatePhase,
    batch: Vec<Request>,
) -> Result<()> {
    let instances = phase.execute(batch)?;
    let mut handler = PlacementAmendmentHandler::new(
        config.placement_amendment_thread_count,
        state.clone(),
        config.clone(),
    );
    handler.start();
    for instance in instances {
        handler.enqueue(instance)?;
    }
    handler.await_idle();
    handler.shut_down();
    Ok(())
}

#[test]
fn a_deployed_query_runs_with_all_operators_placed() -> Result<()> {
    let state = coordinator_state();
    let config = test_config();
    let phase = UpdatePhase::new(state.clone(), config.clone());

    run_and_deploy(
        &state,
        &config,
        &phase,
        vec![Request::AddQuery(AddQueryRequest::new(
            source1_query(1),
            PlacementStrategy::BottomUp,
        ))],
    )?;

    let global = state.read_global_query_plan();
    let plan_id = global.shared_plan_for_query(QueryId::new(1)).unwrap();
    let shared = global.plan(plan_id).unwrap();
    assert_eq!(shared.status(), SharedQueryPlanStatus::Deployed);
    for node in shared.dag().iter() {
        assert_eq!(node.state, OperatorState::Placed);
    }
    assert_eq!(
        state.read_query_catalog().state_of(QueryId::new(1)),
        Some(QueryState::Running)
    );

    // Slots were accounted on the hosting workers.
    let topology = state.read_topology();
    assert_eq!(topology.remaining_slots(WorkerId::new(5)), 1);
    assert_eq!(topology.remaining_slots(WorkerId::new(1)), 99);
    drop(topology);

    // The deployment layer sees the placed sub-plans.
    let summary = state.read_global_execution_plan().deploy_summary(shared);
    assert_eq!(summary.plan_id, plan_id);
    assert_eq!(summary.pending_change_log_entries, 0);
    assert_eq!(summary.placements.len(), 2, "sub-plans on workers 1 and 5");
    for sub_plans in summary.placements.values() {
        assert_eq!(sub_plans.len(), 1);
        assert_eq!(sub_plans[0].occupied_slots, 1);
    }
    Ok(())
}

#[test]
fn stopping_one_of_two_merged_queries_keeps_the_other_running() -> Result<()> {
    let state = coordinator_state();
    let config = CoordinatorConfig {
        query_merger_rule: QueryMergerRule::SyntaxBasedComplete,
        ..test_config()
    };
    let phase = UpdatePhase::new(state.clone(), config.clone());

    run_and_deploy(
        &state,
        &config,
        &phase,
        vec![
            Request::AddQuery(AddQueryRequest::new(
                source1_query(1),
                PlacementStrategy::BottomUp,
            )),
            Request::AddQuery(AddQueryRequest::new(
                source1_query(2),
                PlacementStrategy::BottomUp,
            )),
        ],
    )?;
    run_and_deploy(
        &state,
        &config,
        &phase,
        vec![Request::StopQuery(StopQueryRequest::new(QueryId::new(2)))],
    )?;

    let global = state.read_global_query_plan();
    let plan_id = global.shared_plan_for_query(QueryId::new(1)).unwrap();
    let shared = global.plan(plan_id).unwrap();
    assert_eq!(shared.status(), SharedQueryPlanStatus::Deployed);
    assert_hosted_queries(shared, &[QueryId::new(1)]);
    assert_eq!(shared.dag().sinks().len(), 1, "the stopped sink is gone");

    let catalog = state.read_query_catalog();
    assert_eq!(catalog.state_of(QueryId::new(1)), Some(QueryState::Running));
    assert_eq!(catalog.state_of(QueryId::new(2)), Some(QueryState::Stopped));
    Ok(())
}

#[test]
fn stopping_the_last_query_makes_the_plan_collectable() -> Result<()> {
    let state = coordinator_state();
    let config = test_config();
    let phase = UpdatePhase::new(state.clone(), config.clone());

    run_and_deploy(
        &state,
        &config,
        &phase,
        vec![Request::AddQuery(AddQueryRequest::new(
            source1_query(1),
            PlacementStrategy::BottomUp,
        ))],
    )?;
    run_and_deploy(
        &state,
        &config,
        &phase,
        vec![Request::StopQuery(StopQueryRequest::new(QueryId::new(1)))],
    )?;

    {
        let global = state.read_global_query_plan();
        // The stopped plan still shows up for deployment until collected.
        assert_eq!(global.shared_plans_to_deploy().len(), 1);
        let shared = global.plan(global.shared_plans_to_deploy()[0]).unwrap();
        assert_eq!(shared.status(), SharedQueryPlanStatus::Stopped);
    }

    // Undeployment released every slot.
    let topology = state.read_topology();
    assert_eq!(topology.remaining_slots(WorkerId::new(5)), 2);
    assert_eq!(topology.remaining_slots(WorkerId::new(1)), 100);
    drop(topology);

    let storage = TwoPhaseLockingStorageHandler::new(state.clone(), Duration::from_millis(100), 1);
    let mut holder = storage.acquire(&[ResourceId::GlobalQueryPlan])?;
    holder.global_query_plan_mut().remove_failed_or_stopped();
    assert!(holder.global_query_plan().shared_plans_to_deploy().is_empty());
    assert!(holder.global_query_plan().is_empty());
    Ok(())
}

#[test]
fn incremental_placement_leaves_deployed_operators_alone() -> Result<()> {
    let state = coordinator_state();
    let config = CoordinatorConfig {
        query_merger_rule: QueryMergerRule::SyntaxBasedComplete,
        enable_incremental_placement: true,
        ..test_config()
    };
    let phase = UpdatePhase::new(state.clone(), config.clone());

    run_and_deploy(
        &state,
        &config,
        &phase,
        vec![Request::AddQuery(AddQueryRequest::new(
            source1_query(1),
            PlacementStrategy::BottomUp,
        ))],
    )?;

    let plan_id = state
        .read_global_query_plan()
        .shared_plan_for_query(QueryId::new(1))
        .unwrap();
    let placements_before = state.read_global_execution_plan().placements_of(plan_id);

    // The second identical query merges; only its sink needs placement.
    run_and_deploy(
        &state,
        &config,
        &phase,
        vec![Request::AddQuery(AddQueryRequest::new(
            source1_query(2),
            PlacementStrategy::BottomUp,
        ))],
    )?;

    let execution = state.read_global_execution_plan();
    for (operator, worker) in placements_before {
        assert_eq!(
            execution.worker_of(plan_id, operator),
            Some(worker),
            "operator {operator} moved during an incremental amendment"
        );
    }
    let global = state.read_global_query_plan();
    let shared = global.plan(plan_id).unwrap();
    assert_eq!(shared.dag().sinks().len(), 2);
    for sink in shared.dag().sinks() {
        assert_eq!(shared.dag().get(sink).unwrap().state, OperatorState::Placed);
    }
    Ok(())
}

#[test]
fn shutdown_rejects_new_work() {
    let state = coordinator_state();
    let config = test_config();

    let instance = fluxmesh::PlacementAmendmentInstance::new(
        fluxmesh::SharedPlanId::new(1),
        PlacementStrategy::BottomUp,
        config.placement_amendment_mode,
        config.occ_retry_count,
    );

    // Never started: no queue to accept work.
    let handler = PlacementAmendmentHandler::new(2, state.clone(), config.clone());
    assert!(matches!(handler.enqueue(instance), Err(StorageError::ShutDown)));

    let mut handler = PlacementAmendmentHandler::new(2, state, config);
    handler.start();
    handler.shut_down();
    assert!(matches!(handler.enqueue(instance), Err(StorageError::ShutDown)));
}
