//! Logical operators and the arena-backed operator DAG.
//!
//! This module defines:
//! - [`OperatorId`]: process-wide unique operator identity.
//! - [`OperatorKind`]: the tagged variant of logical operators (source,
//!   filter, map, projection, union, join, sink).
//! - [`OperatorState`]: the placement lifecycle of one operator.
//! - [`OperatorDag`]: an arena of operators keyed by id, storing upstream and
//!   downstream neighbor *ids* rather than pointers.
//!
//! Orientation: *upstream* neighbors are toward the sources (children),
//! *downstream* neighbors are toward the sinks (parents). Sinks are the DAG
//! roots. Every non-source operator has at least one upstream neighbor and
//! every non-sink at least one downstream neighbor; schemas of upstream
//! outputs must unify with downstream inputs (checked by
//! [`OperatorDag::validate`]).

use crate::schema::Schema;
use crate::topology::WorkerId;
use crate::utils::IdSequence;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

static NEXT_OPERATOR_ID: IdSequence = IdSequence::new();

/// Unique numeric identifier for a logical operator.
///
/// Ids are drawn from a process-wide monotonic sequence so they stay unique
/// across shared plans; merging never has to renumber.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct OperatorId(u64);

impl OperatorId {
    /// Draw a fresh id from the process-wide sequence.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_OPERATOR_ID.next())
    }

    /// Return the underlying numeric value.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Placement lifecycle of an operator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorState {
    /// Not yet deployed; the next amendment must place it.
    #[default]
    ToBePlaced,
    /// Deployed and running on its worker.
    Placed,
    /// Deployed, but its role moves to a replacement operator; the next
    /// amendment re-places it together with the replacement.
    ToBeReplaced,
    /// Deployed, but scheduled for undeployment.
    ToBeRemoved,
    /// Undeployed tombstone; ignored by traversals.
    Removed,
}

/// A comparison predicate over one field, as used by filters and joins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    Eq(String, i64),
    Ne(String, i64),
    Lt(String, i64),
    Le(String, i64),
    Gt(String, i64),
    Ge(String, i64),
}

impl Predicate {
    /// Name of the field the predicate reads.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Predicate::Eq(f, _)
            | Predicate::Ne(f, _)
            | Predicate::Lt(f, _)
            | Predicate::Le(f, _)
            | Predicate::Gt(f, _)
            | Predicate::Ge(f, _) => f,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Eq(field, v) => write!(f, "{field}=={v}"),
            Predicate::Ne(field, v) => write!(f, "{field}!={v}"),
            Predicate::Lt(field, v) => write!(f, "{field}<{v}"),
            Predicate::Le(field, v) => write!(f, "{field}<={v}"),
            Predicate::Gt(field, v) => write!(f, "{field}>{v}"),
            Predicate::Ge(field, v) => write!(f, "{field}>={v}"),
        }
    }
}

/// Arithmetic applied by a map operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A single-field map expression: `output_field = input_field <op> operand`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapExpr {
    pub output_field: String,
    pub input_field: String,
    pub op: ArithmeticOp,
    pub operand: i64,
}

impl fmt::Display for MapExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            ArithmeticOp::Add => '+',
            ArithmeticOp::Sub => '-',
            ArithmeticOp::Mul => '*',
            ArithmeticOp::Div => '/',
        };
        write!(
            f,
            "{}={}{}{}",
            self.output_field, self.input_field, op, self.operand
        )
    }
}

/// Where a sink delivers its results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkDescriptor {
    /// Discard results (test and benchmark sink).
    Null,
    /// Print results on the hosting worker.
    Print,
    /// Append results to a file on the hosting worker.
    File(String),
}

/// The tagged variant of logical operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorKind {
    /// Reads a logical source; always a DAG leaf.
    Source { logical_source: String },
    Filter { predicate: Predicate },
    Map { expr: MapExpr },
    Projection { fields: Vec<String> },
    /// Merges two or more streams with unifiable schemas.
    Union,
    /// Equi-join on one field per side.
    Join { left_key: String, right_key: String },
    /// Delivers results; always a DAG root.
    Sink { descriptor: SinkDescriptor },
}

impl OperatorKind {
    /// Short tag used in logs and canonical signatures.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            OperatorKind::Source { .. } => "source",
            OperatorKind::Filter { .. } => "filter",
            OperatorKind::Map { .. } => "map",
            OperatorKind::Projection { .. } => "project",
            OperatorKind::Union => "union",
            OperatorKind::Join { .. } => "join",
            OperatorKind::Sink { .. } => "sink",
        }
    }
}

/// One operator in the arena.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorNode {
    pub id: OperatorId,
    pub kind: OperatorKind,
    pub input_schema: Schema,
    pub output_schema: Schema,
    pub state: OperatorState,
    /// Fixed placement: sources pin to their physical-source worker, sinks to
    /// the root, and manual placement pins everything.
    pub pinned_worker: Option<WorkerId>,
    /// Slots the operator occupies on its worker.
    pub cost: u32,
    upstream: BTreeSet<OperatorId>,
    downstream: BTreeSet<OperatorId>,
}

impl OperatorNode {
    /// Create a fresh operator of the given kind with a generated id.
    #[must_use]
    pub fn new(kind: OperatorKind) -> Self {
        Self {
            id: OperatorId::generate(),
            kind,
            input_schema: Schema::empty(),
            output_schema: Schema::empty(),
            state: OperatorState::default(),
            pinned_worker: None,
            cost: 1,
            upstream: BTreeSet::new(),
            downstream: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(self.kind, OperatorKind::Source { .. })
    }

    #[must_use]
    pub fn is_sink(&self) -> bool {
        matches!(self.kind, OperatorKind::Sink { .. })
    }

    /// Clone the operator without its neighbor sets. Used when a merger rule
    /// transplants operators into another arena and rewires them there.
    #[must_use]
    pub fn detached_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.upstream.clear();
        clone.downstream.clear();
        clone
    }

    /// Upstream neighbor ids (toward the sources).
    #[must_use]
    pub fn upstream(&self) -> &BTreeSet<OperatorId> {
        &self.upstream
    }

    /// Downstream neighbor ids (toward the sinks).
    #[must_use]
    pub fn downstream(&self) -> &BTreeSet<OperatorId> {
        &self.downstream
    }
}

/// Arena of operators forming a DAG with sinks as roots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OperatorDag {
    operators: BTreeMap<OperatorId, OperatorNode>,
}

impl OperatorDag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an operator and return its id.
    pub fn insert(&mut self, node: OperatorNode) -> OperatorId {
        let id = node.id;
        self.operators.insert(id, node);
        id
    }

    /// Connect `upstream -> downstream` (data flows from `upstream`).
    /// Unknown ids are ignored; [`OperatorDag::validate`] catches dangling
    /// edges.
    pub fn connect(&mut self, upstream: OperatorId, downstream: OperatorId) {
        if let Some(up) = self.operators.get_mut(&upstream) {
            up.downstream.insert(downstream);
        }
        if let Some(down) = self.operators.get_mut(&downstream) {
            down.upstream.insert(upstream);
        }
    }

    /// Remove the edge between two operators.
    pub fn disconnect(&mut self, upstream: OperatorId, downstream: OperatorId) {
        if let Some(up) = self.operators.get_mut(&upstream) {
            up.downstream.remove(&downstream);
        }
        if let Some(down) = self.operators.get_mut(&downstream) {
            down.upstream.remove(&upstream);
        }
    }

    #[must_use]
    pub fn get(&self, id: OperatorId) -> Option<&OperatorNode> {
        self.operators.get(&id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: OperatorId) -> Option<&mut OperatorNode> {
        self.operators.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: OperatorId) -> bool {
        self.operators.contains_key(&id)
    }

    /// Number of live (non-tombstoned) operators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live operators (tombstones excluded).
    pub fn iter(&self) -> impl Iterator<Item = &OperatorNode> {
        self.operators
            .values()
            .filter(|n| n.state != OperatorState::Removed)
    }

    /// All operators including tombstones.
    pub fn iter_all(&self) -> impl Iterator<Item = &OperatorNode> {
        self.operators.values()
    }

    /// Ids of live source operators.
    #[must_use]
    pub fn sources(&self) -> Vec<OperatorId> {
        self.iter().filter(|n| n.is_source()).map(|n| n.id).collect()
    }

    /// Ids of live sink operators.
    #[must_use]
    pub fn sinks(&self) -> Vec<OperatorId> {
        self.iter().filter(|n| n.is_sink()).map(|n| n.id).collect()
    }

    /// Live operators of a given state.
    #[must_use]
    pub fn in_state(&self, state: OperatorState) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|n| n.state == state)
            .map(|n| n.id)
            .collect()
    }

    /// Live operators in topological order, sources first.
    #[must_use]
    pub fn topo_order(&self) -> Vec<OperatorId> {
        let mut indegree: BTreeMap<OperatorId, usize> = BTreeMap::new();
        for node in self.iter() {
            indegree.insert(
                node.id,
                node.upstream
                    .iter()
                    .filter(|u| self.get(**u).is_some_and(|n| n.state != OperatorState::Removed))
                    .count(),
            );
        }
        let mut queue: VecDeque<OperatorId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(node) = self.operators.get(&id) {
                for down in &node.downstream {
                    if let Some(d) = indegree.get_mut(down) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(*down);
                        }
                    }
                }
            }
        }
        order
    }

    /// Live operators lying on a path from any operator in `upstream` to any
    /// operator in `downstream`, both boundaries included.
    #[must_use]
    pub fn region(
        &self,
        upstream: &BTreeSet<OperatorId>,
        downstream: &BTreeSet<OperatorId>,
    ) -> BTreeSet<OperatorId> {
        // Forward reachability from the upstream boundary...
        let mut forward = BTreeSet::new();
        let mut queue: VecDeque<OperatorId> = upstream.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if forward.insert(id) {
                if downstream.contains(&id) {
                    continue;
                }
                if let Some(node) = self.operators.get(&id) {
                    queue.extend(node.downstream.iter().copied());
                }
            }
        }
        // ...intersected with backward reachability from the downstream one.
        let mut backward = BTreeSet::new();
        let mut queue: VecDeque<OperatorId> = downstream.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if backward.insert(id) {
                if upstream.contains(&id) {
                    continue;
                }
                if let Some(node) = self.operators.get(&id) {
                    queue.extend(node.upstream.iter().copied());
                }
            }
        }
        forward.intersection(&backward).copied().collect()
    }

    /// Nearest live operators upstream of `id` that satisfy `pred`, searching
    /// breadth-first toward the sources.
    #[must_use]
    pub fn nearest_upstream_where<F>(&self, id: OperatorId, pred: F) -> Vec<OperatorId>
    where
        F: Fn(&OperatorNode) -> bool,
    {
        self.nearest_where(id, pred, |node| &node.upstream)
    }

    /// Nearest live operators downstream of `id` that satisfy `pred`,
    /// searching breadth-first toward the sinks.
    #[must_use]
    pub fn nearest_downstream_where<F>(&self, id: OperatorId, pred: F) -> Vec<OperatorId>
    where
        F: Fn(&OperatorNode) -> bool,
    {
        self.nearest_where(id, pred, |node| &node.downstream)
    }

    fn nearest_where<F, N>(&self, id: OperatorId, pred: F, neighbors: N) -> Vec<OperatorId>
    where
        F: Fn(&OperatorNode) -> bool,
        N: Fn(&OperatorNode) -> &BTreeSet<OperatorId>,
    {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::from([id]);
        let mut queue: VecDeque<OperatorId> = self
            .operators
            .get(&id)
            .map(|n| neighbors(n).iter().copied().collect())
            .unwrap_or_default();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.operators.get(&current) else {
                continue;
            };
            if node.state != OperatorState::Removed && pred(node) {
                found.insert(current);
            } else {
                queue.extend(neighbors(node).iter().copied());
            }
        }
        found.into_iter().collect()
    }

    /// Check the structural invariants: every non-source has an upstream
    /// neighbor, every non-sink a downstream one, edges resolve, and schemas
    /// unify along every edge (skipped while schemas are still empty).
    ///
    /// Returns the first violation as a human-readable message.
    pub fn validate(&self) -> Result<(), String> {
        for node in self.iter() {
            if !node.is_source() && node.upstream.is_empty() {
                return Err(format!("{} has no upstream operator", node.id));
            }
            if !node.is_sink() && node.downstream.is_empty() {
                return Err(format!("{} has no downstream operator", node.id));
            }
            for down in &node.downstream {
                let Some(target) = self.operators.get(down) else {
                    return Err(format!("{} references missing operator {down}", node.id));
                };
                if !node.output_schema.is_empty()
                    && !target.input_schema.is_empty()
                    && !node.output_schema.unifies_with(&target.input_schema)
                {
                    return Err(format!(
                        "schema of {} does not unify with input of {down}",
                        node.id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Absorb every operator of `other` into this arena. Ids are globally
    /// unique, so this is a plain move.
    pub fn absorb(&mut self, other: OperatorDag) {
        self.operators.extend(other.operators);
    }
}
