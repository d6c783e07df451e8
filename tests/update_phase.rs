use anyhow::Result;
use fluxmesh::testing::{
    assert_entry_boundaries, assert_pending_entries, coordinator_state, test_config, test_schema,
};
use fluxmesh::utils::now_micros;
use fluxmesh::{
    AddQueryRequest, CoordinatorConfig, IsqpEvent, IsqpRequest, LinkProperties, OperatorState,
    PhysicalSourceEntry, PlacementStrategy, Query, QueryId, QueryState, RemoveLinkRequest, Request,
    ResourceId, SinkDescriptor, SourceCatalog, StopQueryRequest, Topology, TopologyNode,
    TwoPhaseLockingStorageHandler, UpdateError, UpdatePhase, WorkerId, WorkerType,
};
use std::time::Duration;

fn source1_query(id: u64) -> fluxmesh::QueryPlan {
    Query::from("source1")
        .sink(SinkDescriptor::Print)
        .with_query_id(QueryId::new(id))
}

fn add(id: u64) -> Request {
    Request::AddQuery(AddQueryRequest::new(
        source1_query(id),
        PlacementStrategy::BottomUp,
    ))
}

#[test]
fn single_add_produces_one_deployable_plan() -> Result<()> {
    let state = coordinator_state();
    let phase = UpdatePhase::new(state.clone(), test_config());

    let instances = phase.execute(vec![add(1)])?;
    assert_eq!(instances.len(), 1);

    let global = state.read_global_query_plan();
    let to_deploy = global.shared_plans_to_deploy();
    assert_eq!(to_deploy.len(), 1);

    let plan = global.plan(to_deploy[0]).unwrap();
    let entries = plan.change_log_entries(now_micros());
    assert_eq!(entries.len(), 1);
    let entry = entries[0].1;
    assert_entry_boundaries(entry, 1, 1);
    // Upstream is the source operator, downstream the sink.
    let upstream = plan.dag().get(*entry.upstream.iter().next().unwrap()).unwrap();
    let downstream = plan.dag().get(*entry.downstream.iter().next().unwrap()).unwrap();
    assert!(upstream.is_source());
    assert!(downstream.is_sink());
    assert_eq!(upstream.state, OperatorState::ToBePlaced);
    assert_eq!(downstream.state, OperatorState::ToBePlaced);

    assert_eq!(
        state.read_query_catalog().state_of(QueryId::new(1)),
        Some(QueryState::Optimizing)
    );
    Ok(())
}

#[test]
fn duplicate_query_ids_reject_the_whole_batch() {
    let state = coordinator_state();
    let phase = UpdatePhase::new(state.clone(), test_config());

    let result = phase.execute(vec![add(1), add(1)]);
    assert!(matches!(
        result,
        Err(UpdateError::DuplicateQueryInBatch(id)) if id == QueryId::new(1)
    ));
    assert!(state.read_global_query_plan().is_empty());
    assert!(state.read_query_catalog().is_empty());
}

#[test]
fn invalid_query_id_rejects_the_batch() {
    let state = coordinator_state();
    let phase = UpdatePhase::new(state.clone(), test_config());

    let result = phase.execute(vec![add(0)]);
    assert!(matches!(result, Err(UpdateError::InvalidQueryId(_))));
    assert!(state.read_global_query_plan().is_empty());
}

#[test]
fn failed_query_rejects_the_batch() -> Result<()> {
    let state = coordinator_state();
    let config = test_config();

    // Seed the catalog with a failed query under the same id.
    let storage =
        TwoPhaseLockingStorageHandler::new(state.clone(), Duration::from_millis(100), 1);
    {
        let mut holder = storage.acquire(&[ResourceId::QueryCatalog])?;
        holder
            .query_catalog_mut()
            .register(QueryId::new(1), PlacementStrategy::BottomUp)?;
        holder
            .query_catalog_mut()
            .set_state(QueryId::new(1), QueryState::Failed)?;
    }

    let phase = UpdatePhase::new(state.clone(), config);
    let result = phase.execute(vec![add(1)]);
    assert!(matches!(result, Err(UpdateError::QueryInFailedState(_))));
    assert!(state.read_global_query_plan().is_empty());
    Ok(())
}

#[test]
fn a_failing_request_reverts_the_earlier_ones() {
    let state = coordinator_state();
    let phase = UpdatePhase::new(state.clone(), test_config());

    // First request is fine; the stop of an unknown query poisons the batch.
    let result = phase.execute(vec![
        add(1),
        Request::StopQuery(StopQueryRequest::new(QueryId::new(77))),
    ]);
    assert!(matches!(result, Err(UpdateError::UnknownQuery(_))));
    assert!(state.read_global_query_plan().is_empty());
    assert!(state.read_query_catalog().is_empty());
}

#[test]
fn stop_of_the_only_query_stops_the_shared_plan() -> Result<()> {
    let state = coordinator_state();
    let phase = UpdatePhase::new(state.clone(), test_config());

    phase.execute(vec![add(1)])?;
    phase.execute(vec![Request::StopQuery(StopQueryRequest::new(QueryId::new(
        1,
    )))])?;

    let global = state.read_global_query_plan();
    let to_deploy = global.shared_plans_to_deploy();
    assert_eq!(to_deploy.len(), 1);
    let plan = global.plan(to_deploy[0]).unwrap();
    assert_eq!(
        plan.status(),
        fluxmesh::SharedQueryPlanStatus::Stopped
    );
    for node in plan.dag().iter_all() {
        assert_eq!(node.state, OperatorState::ToBeRemoved);
    }
    assert_eq!(
        state.read_query_catalog().state_of(QueryId::new(1)),
        Some(QueryState::MarkedForStop)
    );
    Ok(())
}

#[test]
fn topology_requests_need_reconfiguration_enabled() {
    let state = coordinator_state();
    let config = CoordinatorConfig {
        enable_query_reconfiguration: false,
        ..test_config()
    };
    let phase = UpdatePhase::new(state.clone(), config);

    let result = phase.execute(vec![Request::RemoveLink(RemoveLinkRequest::new(
        WorkerId::new(3),
        WorkerId::new(5),
    ))]);
    assert!(matches!(result, Err(UpdateError::ReconfigurationDisabled)));
    assert!(state.read_topology().has_link(WorkerId::new(3), WorkerId::new(5)));
}

#[test]
fn isqp_batch_builds_topology_and_accepts_a_query() -> Result<()> {
    // Start from an empty topology; the batch constructs it.
    let mut sources = SourceCatalog::new();
    sources.add_logical_source("test", test_schema())?;
    sources.add_physical_source(
        "test",
        PhysicalSourceEntry {
            physical_name: "pTest1".into(),
            worker: WorkerId::new(4),
        },
    )?;
    let state = fluxmesh::CoordinatorState::new(Topology::new(), sources);
    let phase = UpdatePhase::new(state.clone(), test_config());

    let node = |id: u64, ty: WorkerType, slots: u32| {
        TopologyNode::new(WorkerId::new(id), ty, "localhost", 4000, 4002, slots)
    };
    let events = vec![
        IsqpEvent::AddNode(node(1, WorkerType::Cloud, 4)),
        IsqpEvent::AddNode(node(2, WorkerType::Sensor, 4)),
        IsqpEvent::AddNode(node(3, WorkerType::Sensor, 4)),
        IsqpEvent::AddNode(node(4, WorkerType::Sensor, 4)),
        IsqpEvent::AddLink {
            upstream: WorkerId::new(2),
            downstream: WorkerId::new(1),
        },
        IsqpEvent::AddLink {
            upstream: WorkerId::new(3),
            downstream: WorkerId::new(2),
        },
        IsqpEvent::AddLink {
            upstream: WorkerId::new(4),
            downstream: WorkerId::new(3),
        },
        IsqpEvent::AddLinkProperty {
            upstream: WorkerId::new(4),
            downstream: WorkerId::new(3),
            properties: LinkProperties::new(1.0, 1.0),
        },
        IsqpEvent::AddQuery {
            plan: Query::from("test")
                .sink(SinkDescriptor::Null)
                .with_query_id(QueryId::new(1)),
            strategy: PlacementStrategy::BottomUp,
        },
    ];

    let instances = phase.execute(vec![Request::Isqp(IsqpRequest::new(events))])?;
    assert_eq!(instances.len(), 1);

    let topology = state.read_topology();
    assert_eq!(topology.root(), Some(WorkerId::new(1)));
    assert!(topology.contains(WorkerId::new(4)));
    assert_eq!(
        topology.link_properties(WorkerId::new(4), WorkerId::new(3)),
        Some(LinkProperties::new(1.0, 1.0))
    );
    drop(topology);

    let global = state.read_global_query_plan();
    let plan = global.plan(instances[0].plan_id).unwrap();
    assert_pending_entries(plan, 1);
    Ok(())
}

#[test]
fn every_accepted_query_is_reachable_through_the_index() -> Result<()> {
    let state = coordinator_state();
    let phase = UpdatePhase::new(state.clone(), test_config());

    phase.execute(vec![add(1), add(2), add(3)])?;

    let global = state.read_global_query_plan();
    for id in [1, 2, 3] {
        assert!(
            global.shared_plan_for_query(QueryId::new(id)).is_some(),
            "query {id} not reachable"
        );
    }
    Ok(())
}
