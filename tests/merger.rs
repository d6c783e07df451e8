use anyhow::Result;
use fluxmesh::testing::{assert_hosted_queries, assert_pending_entries, coordinator_state, test_config};
use fluxmesh::{
    AddQueryRequest, CoordinatorConfig, OperatorKind, PlacementStrategy, Predicate, Query, QueryId,
    QueryMergerRule, QueryPlan, Request, SinkDescriptor, UpdatePhase,
};

fn source1_query(id: u64) -> QueryPlan {
    Query::from("source1")
        .sink(SinkDescriptor::Print)
        .with_query_id(QueryId::new(id))
}

fn run_batch(rule: QueryMergerRule, requests: Vec<Request>) -> Result<fluxmesh::CoordinatorState> {
    let state = coordinator_state();
    let config = CoordinatorConfig {
        query_merger_rule: rule,
        ..test_config()
    };
    let phase = UpdatePhase::new(state.clone(), config);
    phase.execute(requests)?;
    Ok(state)
}

#[test]
fn syntax_rule_merges_identical_queries() -> Result<()> {
    let state = run_batch(
        QueryMergerRule::SyntaxBasedComplete,
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

    let global = state.read_global_query_plan();
    assert_eq!(global.len(), 1, "both queries share one plan");
    let plan_id = global.shared_plan_for_query(QueryId::new(1)).unwrap();
    assert_eq!(global.shared_plan_for_query(QueryId::new(2)), Some(plan_id));
    let plan = global.plan(plan_id).unwrap();
    assert_hosted_queries(plan, &[QueryId::new(1), QueryId::new(2)]);
    assert_eq!(plan.dag().sinks().len(), 2, "each query keeps its sink");
    assert_eq!(plan.dag().sources().len(), 1, "the source deploys once");
    Ok(())
}

#[test]
fn syntax_rule_keeps_different_predicates_apart() -> Result<()> {
    let narrow = Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 10))
        .sink(SinkDescriptor::Print)
        .with_query_id(QueryId::new(1));
    let wide = Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 99))
        .sink(SinkDescriptor::Print)
        .with_query_id(QueryId::new(2));

    let state = run_batch(
        QueryMergerRule::SyntaxBasedComplete,
        vec![
            Request::AddQuery(AddQueryRequest::new(narrow, PlacementStrategy::BottomUp)),
            Request::AddQuery(AddQueryRequest::new(wide, PlacementStrategy::BottomUp)),
        ],
    )?;

    assert_eq!(state.read_global_query_plan().len(), 2);
    Ok(())
}

#[test]
fn default_rule_never_merges() -> Result<()> {
    let state = run_batch(
        QueryMergerRule::Default,
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
    assert_eq!(state.read_global_query_plan().len(), 2);
    Ok(())
}

#[test]
fn merging_never_crosses_placement_strategies() -> Result<()> {
    let state = run_batch(
        QueryMergerRule::SyntaxBasedComplete,
        vec![
            Request::AddQuery(AddQueryRequest::new(
                source1_query(1),
                PlacementStrategy::BottomUp,
            )),
            Request::AddQuery(AddQueryRequest::new(
                source1_query(2),
                PlacementStrategy::TopDown,
            )),
        ],
    )?;
    assert_eq!(
        state.read_global_query_plan().len(),
        2,
        "identical queries with different strategies stay separate"
    );
    Ok(())
}

#[test]
fn signature_rule_merges_reordered_unions() -> Result<()> {
    let left_first = Query::from("source1")
        .union_with(Query::from("source2"))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));
    let right_first = Query::from("source2")
        .union_with(Query::from("source1"))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(2));

    let state = run_batch(
        QueryMergerRule::SignatureBasedComplete,
        vec![
            Request::AddQuery(AddQueryRequest::new(left_first, PlacementStrategy::BottomUp)),
            Request::AddQuery(AddQueryRequest::new(right_first, PlacementStrategy::BottomUp)),
        ],
    )?;

    let global = state.read_global_query_plan();
    assert_eq!(global.len(), 1, "commutative unions merge under signatures");
    let plan_id = global.shared_plan_for_query(QueryId::new(1)).unwrap();
    assert_hosted_queries(global.plan(plan_id).unwrap(), &[QueryId::new(1), QueryId::new(2)]);
    Ok(())
}

#[test]
fn partial_rule_shares_the_common_prefix() -> Result<()> {
    let filtered = Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 5))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));
    // Same source and filter, one extra projection before the sink.
    let projected = Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 5))
        .project(&["f1"])
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(2));

    let state = run_batch(
        QueryMergerRule::SignatureBasedPartial,
        vec![
            Request::AddQuery(AddQueryRequest::new(filtered, PlacementStrategy::BottomUp)),
            Request::AddQuery(AddQueryRequest::new(projected, PlacementStrategy::BottomUp)),
        ],
    )?;

    let global = state.read_global_query_plan();
    assert_eq!(global.len(), 1, "the common prefix is shared");
    let plan_id = global.shared_plan_for_query(QueryId::new(2)).unwrap();
    let plan = global.plan(plan_id).unwrap();
    assert_hosted_queries(plan, &[QueryId::new(1), QueryId::new(2)]);

    // One source, one filter, one projection, two sinks.
    assert_eq!(plan.dag().sources().len(), 1);
    assert_eq!(plan.dag().sinks().len(), 2);
    let projections = plan
        .dag()
        .iter()
        .filter(|n| matches!(n.kind, OperatorKind::Projection { .. }))
        .count();
    assert_eq!(projections, 1);
    assert_eq!(plan.dag().len(), 5);

    // Two live entries: the first query's full region and the attached
    // branch (frontier up to the new sink); the regions do not overlap.
    assert_pending_entries(plan, 2);
    Ok(())
}

#[test]
fn signature_unavailable_rejects_the_batch() {
    struct Unavailable;
    impl fluxmesh::SignatureInference for Unavailable {
        fn infer(
            &self,
            _dag: &fluxmesh::OperatorDag,
        ) -> std::result::Result<fluxmesh::signature::SignatureMap, fluxmesh::SignatureError>
        {
            Err(fluxmesh::SignatureError("inference timed out".into()))
        }
    }

    let state = coordinator_state();
    let config = CoordinatorConfig {
        query_merger_rule: QueryMergerRule::SignatureBasedComplete,
        ..test_config()
    };
    let phase =
        UpdatePhase::new(state.clone(), config).with_signature_inference(Box::new(Unavailable));

    // The second add triggers merging against the first plan and needs
    // signatures; the whole batch must reject atomically.
    let result = phase.execute(vec![
        Request::AddQuery(AddQueryRequest::new(
            source1_query(1),
            PlacementStrategy::BottomUp,
        )),
        Request::AddQuery(AddQueryRequest::new(
            source1_query(2),
            PlacementStrategy::BottomUp,
        )),
    ]);

    assert!(matches!(
        result,
        Err(fluxmesh::UpdateError::SignatureUnavailable { .. })
    ));
    assert!(state.read_global_query_plan().is_empty());
    assert!(state.read_query_catalog().is_empty());
}
