use anyhow::Result;
use fluxmesh::signature::infer_schemas;
use fluxmesh::testing::{TestSourceCatalogBuilder, test_schema};
use fluxmesh::{
    ArithmeticOp, CanonicalSignatureInference, FieldType, MapExpr, OperatorKind, Predicate, Query,
    QueryId, Schema, SignatureInference, SinkDescriptor, UpdateError,
};

#[test]
fn builder_produces_a_single_sink_root() {
    let plan = Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 10))
        .map(MapExpr {
            output_field: "f3".into(),
            input_field: "f1".into(),
            op: ArithmeticOp::Mul,
            operand: 2,
        })
        .sink(SinkDescriptor::Print)
        .with_query_id(QueryId::new(1));

    assert_eq!(plan.dag().sinks(), vec![plan.sink()]);
    assert_eq!(plan.dag().sources().len(), 1);
    assert_eq!(plan.dag().len(), 4);
    assert!(plan.dag().validate().is_ok());
}

#[test]
fn union_builder_inserts_the_interface_projection() {
    let plan = Query::from("source1")
        .union_with(Query::from("source2"))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));

    // source1, source2, union, projection, sink
    assert_eq!(plan.dag().len(), 5);
    let union = plan
        .dag()
        .iter()
        .find(|n| matches!(n.kind, OperatorKind::Union))
        .expect("union operator");
    assert_eq!(union.upstream().len(), 2);
    assert_eq!(union.downstream().len(), 1);
    let projection_id = *union.downstream().iter().next().unwrap();
    let projection = plan.dag().get(projection_id).unwrap();
    assert!(matches!(projection.kind, OperatorKind::Projection { .. }));
}

#[test]
fn schema_inference_annotates_the_whole_chain() -> Result<()> {
    let catalog = TestSourceCatalogBuilder::new()
        .source("source1", test_schema(), 5)
        .build();
    let mut plan = Query::from("source1")
        .filter(Predicate::Lt("f2".into(), 7))
        .map(MapExpr {
            output_field: "doubled".into(),
            input_field: "f1".into(),
            op: ArithmeticOp::Mul,
            operand: 2,
        })
        .project(&["doubled"])
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));

    infer_schemas(plan.dag_mut(), &catalog)?;

    let sink = plan.dag().get(plan.sink()).unwrap();
    assert_eq!(sink.input_schema.fields().len(), 1);
    assert_eq!(
        sink.input_schema.field("doubled").map(|f| f.ty),
        Some(FieldType::Int32)
    );
    assert!(plan.dag().validate().is_ok());
    Ok(())
}

#[test]
fn unknown_source_and_unknown_field_are_rejected() {
    let catalog = TestSourceCatalogBuilder::new()
        .source("source1", test_schema(), 5)
        .build();

    let mut unknown_source = Query::from("nosuch")
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));
    assert!(matches!(
        infer_schemas(unknown_source.dag_mut(), &catalog),
        Err(UpdateError::UnknownSource(_))
    ));

    let mut unknown_field = Query::from("source1")
        .filter(Predicate::Eq("missing".into(), 1))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(2));
    assert!(matches!(
        infer_schemas(unknown_field.dag_mut(), &catalog),
        Err(UpdateError::SchemaMismatch { .. })
    ));
}

#[test]
fn union_inputs_must_unify() {
    let catalog = TestSourceCatalogBuilder::new()
        .source("source1", test_schema(), 5)
        .source("other", Schema::empty().with_field("x", FieldType::Text), 6)
        .build();
    let mut plan = Query::from("source1")
        .union_with(Query::from("other"))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));

    assert!(matches!(
        infer_schemas(plan.dag_mut(), &catalog),
        Err(UpdateError::SchemaMismatch { .. })
    ));
}

#[test]
fn join_schema_combines_both_sides() -> Result<()> {
    let catalog = TestSourceCatalogBuilder::new()
        .source("source1", test_schema(), 5)
        .source(
            "source2",
            Schema::empty()
                .with_field("f1", FieldType::Int32)
                .with_field("g1", FieldType::Int64),
            6,
        )
        .build();
    let mut plan = Query::from("source1")
        .join_with(Query::from("source2"), "f1", "f1")
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));

    infer_schemas(plan.dag_mut(), &catalog)?;

    let join = plan
        .dag()
        .iter()
        .find(|n| matches!(n.kind, OperatorKind::Join { .. }))
        .expect("join operator");
    assert_eq!(join.upstream().len(), 2);
    for field in ["f1", "f2", "g1"] {
        assert!(
            join.output_schema.field(field).is_some(),
            "missing '{field}' in join output"
        );
    }
    Ok(())
}

#[test]
fn signatures_erase_union_construction_order() -> Result<()> {
    let left_first = Query::from("source1")
        .union_with(Query::from("source2"))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));
    let right_first = Query::from("source2")
        .union_with(Query::from("source1"))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(2));

    let inference = CanonicalSignatureInference;
    let left_sigs = inference.infer(left_first.dag())?;
    let right_sigs = inference.infer(right_first.dag())?;

    let sig_of_sink = |plan: &fluxmesh::QueryPlan, sigs: &fluxmesh::signature::SignatureMap| {
        sigs.get(&plan.sink()).cloned().expect("sink signature")
    };
    assert_eq!(
        sig_of_sink(&left_first, &left_sigs),
        sig_of_sink(&right_first, &right_sigs)
    );
    Ok(())
}

#[test]
fn different_predicates_produce_different_signatures() -> Result<()> {
    let a = Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 10))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(1));
    let b = Query::from("source1")
        .filter(Predicate::Gt("f1".into(), 11))
        .sink(SinkDescriptor::Null)
        .with_query_id(QueryId::new(2));

    let inference = CanonicalSignatureInference;
    let a_sig = inference.infer(a.dag())?.remove(&a.sink()).unwrap();
    let b_sig = inference.infer(b.dag())?.remove(&b.sink()).unwrap();
    assert_ne!(a_sig, b_sig);
    Ok(())
}
