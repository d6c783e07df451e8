//! Single-query logical plans and the fluent builder that constructs them.
//!
//! Operator-tree construction from user queries is an external collaborator;
//! the builder here is the narrow interface through which query plans enter
//! the coordinator (and the way tests construct them):
//!
//! ```
//! use fluxmesh::operator::{Predicate, SinkDescriptor};
//! use fluxmesh::query_plan::{Query, QueryId};
//!
//! let plan = Query::from("source1")
//!     .filter(Predicate::Gt("f1".into(), 10))
//!     .sink(SinkDescriptor::Print)
//!     .with_query_id(QueryId::new(1));
//! assert_eq!(plan.dag().sources().len(), 1);
//! ```
//!
//! A query plan always has exactly one sink root. `union_with` inserts a
//! pass-through projection downstream of the union operator; the projection
//! normalizes the union's downstream interface and can assume its role when
//! a topology change disrupts the union's placement.

use crate::operator::{
    MapExpr, OperatorDag, OperatorId, OperatorKind, OperatorNode, Predicate, SinkDescriptor,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Client-assigned query identifier. Id 0 is reserved as "invalid".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct QueryId(u64);

impl QueryId {
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Id 0 never names a query.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// A single client query: an operator DAG with one sink root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryPlan {
    query_id: QueryId,
    dag: OperatorDag,
    sink: OperatorId,
}

impl QueryPlan {
    #[must_use]
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Builder-style query-id assignment.
    #[must_use]
    pub fn with_query_id(mut self, id: QueryId) -> Self {
        self.query_id = id;
        self
    }

    #[must_use]
    pub fn dag(&self) -> &OperatorDag {
        &self.dag
    }

    #[must_use]
    pub fn dag_mut(&mut self) -> &mut OperatorDag {
        &mut self.dag
    }

    /// The unique sink root.
    #[must_use]
    pub fn sink(&self) -> OperatorId {
        self.sink
    }

    /// Names of the logical sources the plan reads.
    #[must_use]
    pub fn source_names(&self) -> BTreeSet<String> {
        self.dag
            .iter()
            .filter_map(|n| match &n.kind {
                OperatorKind::Source { logical_source } => Some(logical_source.clone()),
                _ => None,
            })
            .collect()
    }

    /// Decompose into the raw DAG (used when a shared plan absorbs it).
    #[must_use]
    pub(crate) fn into_parts(self) -> (QueryId, OperatorDag, OperatorId) {
        (self.query_id, self.dag, self.sink)
    }
}

/// Entry point of the fluent builder.
pub struct Query;

impl Query {
    /// Start a query reading the named logical source.
    #[must_use]
    pub fn from(logical_source: impl Into<String>) -> QueryBuilder {
        let mut dag = OperatorDag::new();
        let head = dag.insert(OperatorNode::new(OperatorKind::Source {
            logical_source: logical_source.into(),
        }));
        QueryBuilder { dag, head }
    }
}

/// A query under construction: a DAG plus the operator new stages attach to.
pub struct QueryBuilder {
    dag: OperatorDag,
    head: OperatorId,
}

impl QueryBuilder {
    /// Keep rows matching the predicate.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.push(OperatorKind::Filter { predicate });
        self
    }

    /// Derive a field with a single-field arithmetic expression.
    #[must_use]
    pub fn map(mut self, expr: MapExpr) -> Self {
        self.push(OperatorKind::Map { expr });
        self
    }

    /// Restrict the stream to the named fields.
    #[must_use]
    pub fn project(mut self, fields: &[&str]) -> Self {
        self.push(OperatorKind::Projection {
            fields: fields.iter().map(|s| (*s).to_string()).collect(),
        });
        self
    }

    /// Merge with another stream. Inserts the union operator plus the
    /// pass-through projection that owns the union's downstream interface.
    #[must_use]
    pub fn union_with(mut self, other: QueryBuilder) -> Self {
        let other_head = other.head;
        self.dag.absorb(other.dag);
        let union = self.dag.insert(OperatorNode::new(OperatorKind::Union));
        self.dag.connect(self.head, union);
        self.dag.connect(other_head, union);
        let projection = self
            .dag
            .insert(OperatorNode::new(OperatorKind::Projection { fields: vec![] }));
        self.dag.connect(union, projection);
        self.head = projection;
        self
    }

    /// Equi-join with another stream on one field per side.
    #[must_use]
    pub fn join_with(
        mut self,
        other: QueryBuilder,
        left_key: impl Into<String>,
        right_key: impl Into<String>,
    ) -> Self {
        let other_head = other.head;
        self.dag.absorb(other.dag);
        let join = self.dag.insert(OperatorNode::new(OperatorKind::Join {
            left_key: left_key.into(),
            right_key: right_key.into(),
        }));
        self.dag.connect(self.head, join);
        self.dag.connect(other_head, join);
        self.head = join;
        self
    }

    /// Terminate the query with a sink and produce the plan.
    #[must_use]
    pub fn sink(mut self, descriptor: SinkDescriptor) -> QueryPlan {
        let sink = self
            .dag
            .insert(OperatorNode::new(OperatorKind::Sink { descriptor }));
        self.dag.connect(self.head, sink);
        QueryPlan {
            query_id: QueryId::new(0),
            dag: self.dag,
            sink,
        }
    }

    fn push(&mut self, kind: OperatorKind) {
        let id = self.dag.insert(OperatorNode::new(kind));
        self.dag.connect(self.head, id);
        self.head = id;
    }
}
