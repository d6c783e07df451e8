//! # Fluxmesh
//!
//! An **incremental query-plan coordinator** for distributed stream
//! processing. Fluxmesh maintains two intertwined global structures -- a
//! *global query plan* (a forest of shared plans, each a set of merged
//! client queries) and a *global execution plan* (the placement of operators
//! onto a topology of workers) -- and keeps them consistent while batches of
//! heterogeneous requests arrive.
//!
//! ## Key Features
//!
//! - **Transactional update phase** - a batch of add-query, stop-query and
//!   topology-mutation requests is applied atomically or rejected as a whole
//! - **Query merging** - syntax-based and signature-based rules fuse
//!   equivalent queries into shared plans so common subexpressions deploy
//!   once
//! - **Change-log driven redeployment** - every mutation records the minimal
//!   operator sub-DAG to re-deploy; incremental placement touches nothing
//!   else
//! - **Concurrent placement amendment** - a worker pool applies placement
//!   strategies under two-phase locking or optimistic concurrency control
//! - **Placement strategies** - bottom-up, top-down, and manual operator
//!   placement against worker capacities and link properties
//! - **Type-safe requests** - batch rejection is an explicit `Result` whose
//!   error names the offending request
//!
//! ## Quick Start
//!
//! ```no_run
//! use fluxmesh::*;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! // Describe the worker topology and where physical sources live.
//! let mut topology = Topology::new();
//! topology.set_root(TopologyNode::new(
//!     WorkerId::new(1), WorkerType::Cloud, "localhost", 4000, 4002, 100,
//! ));
//! topology.add_node_as_child(WorkerId::new(1), TopologyNode::new(
//!     WorkerId::new(2), WorkerType::Sensor, "localhost", 4000, 4002, 4,
//! ))?;
//!
//! let mut sources = SourceCatalog::new();
//! sources.add_logical_source(
//!     "readings",
//!     Schema::empty().with_field("value", FieldType::Int32),
//! )?;
//! sources.add_physical_source("readings", PhysicalSourceEntry {
//!     physical_name: "sensor_a".into(),
//!     worker: WorkerId::new(2),
//! })?;
//!
//! // Bring up the coordination core.
//! let state = CoordinatorState::new(topology, sources);
//! let config = CoordinatorConfig::default();
//! let phase = UpdatePhase::new(state.clone(), config.clone());
//! let mut amender = PlacementAmendmentHandler::new(
//!     config.placement_amendment_thread_count,
//!     state.clone(),
//!     config,
//! );
//! amender.start();
//!
//! // Submit a query and let the amenders deploy it.
//! let plan = Query::from("readings")
//!     .filter(Predicate::Gt("value".into(), 42))
//!     .sink(SinkDescriptor::Print)
//!     .with_query_id(QueryId::new(1));
//! let instances = phase.execute(vec![Request::AddQuery(AddQueryRequest::new(
//!     plan,
//!     PlacementStrategy::BottomUp,
//! ))])?;
//! for instance in instances {
//!     amender.enqueue(instance)?;
//! }
//! amender.await_idle();
//! amender.shut_down();
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Shared query plans
//!
//! A [`SharedQueryPlan`] is one merged logical plan hosting one or more
//! client queries. Its operator DAG has sinks as roots, stores neighbor
//! *ids* in an arena (no pointer cycles), and carries a per-plan
//! [`ChangeLog`](changelog::ChangeLog) whose entries bound the sub-DAGs
//! that still need deployment.
//!
//! ### The update phase
//!
//! [`UpdatePhase::execute`] takes a batch of [`Request`]s, validates it,
//! applies every request to working clones of the coordinated resources,
//! and commits wholesale -- a failing request rejects the entire batch with
//! an [`UpdateError`] and no observable state change.
//!
//! ### Placement amendment
//!
//! Every dirty shared plan becomes a [`PlacementAmendmentInstance`]
//! consumed by the [`PlacementAmendmentHandler`] pool. Amenders run the
//! plan's [`PlacementStrategy`] over its change-log region and commit under
//! the configured [`PlacementAmendmentMode`] -- two-phase locking or
//! optimistic validate-and-swap.
//!
//! ## Configuration
//!
//! See [`CoordinatorConfig`]: merger rule, incremental placement, amender
//! pool size, concurrency mode, retry budgets.
//!
//! ## Testing Your Coordinator
//!
//! The [`testing`] module ships assertions, fluent topology/catalog
//! builders, and the standard six-worker fixture used throughout the
//! integration tests.
//!
//! ## Feature Flags
//!
//! - `metrics` (default) - coordinator metrics collection and JSON export
//!
//! ## Module Overview
//!
//! - [`topology`] - worker graph, link properties, path queries
//! - [`operator`] - operator arena: kinds, states, DAG
//! - [`query_plan`] - single-query plans and the fluent builder
//! - [`changelog`] - per-plan change-logs with monotonic timestamps
//! - [`shared_plan`] / [`global_plan`] - the shared-plan forest
//! - [`execution_plan`] - operator-to-worker assignments and sub-plans
//! - [`merger`] - syntax- and signature-based query fusion
//! - [`signature`] - schema propagation and canonical signatures
//! - [`request`] - request sum type and ISQP batch events
//! - [`storage`] - 2PL and OCC storage handlers over the shared resources
//! - [`update_phase`] - transactional batch execution
//! - [`amendment`] - the placement-amendment worker pool
//! - [`placement`] - bottom-up, top-down, and manual strategies
//! - [`catalog`] - source, UDF, and query catalogs
//! - [`metrics`] - execution metrics (feature: `metrics`)
//! - [`testing`] - assertions, builders, fixtures

pub mod amendment;
pub mod catalog;
pub mod changelog;
pub mod config;
pub mod error;
pub mod execution_plan;
pub mod global_plan;
pub mod merger;
pub mod operator;
pub mod placement;
pub mod query_plan;
pub mod request;
pub mod schema;
pub mod shared_plan;
pub mod signature;
pub mod storage;
pub mod testing;
pub mod topology;
pub mod update_phase;
pub mod utils;

#[cfg(feature = "metrics")]
pub mod metrics;

// General re-exports
pub use amendment::{PlacementAmendmentHandler, PlacementAmendmentInstance};
pub use catalog::{
    PhysicalSourceEntry, QueryCatalog, QueryState, SourceCatalog, UdfCatalog, UdfDescriptor,
};
pub use changelog::{ChangeLog, ChangeLogEntry};
pub use config::{CoordinatorConfig, PlacementAmendmentMode, QueryMergerRule};
pub use error::{CatalogError, PlacementError, SignatureError, StorageError, UpdateError};
pub use execution_plan::{DeploySummary, ExecutionNode, GlobalExecutionPlan, SubPlan};
pub use global_plan::GlobalQueryPlan;
pub use operator::{
    ArithmeticOp, MapExpr, OperatorDag, OperatorId, OperatorKind, OperatorNode, OperatorState,
    Predicate, SinkDescriptor,
};
pub use placement::PlacementStrategy;
pub use query_plan::{Query, QueryBuilder, QueryId, QueryPlan};
pub use request::{
    AddQueryRequest, IsqpEvent, IsqpRequest, RemoveLinkRequest, RemoveNodeRequest, Request,
    RequestId, StopQueryRequest,
};
pub use schema::{Field, FieldType, Schema};
pub use shared_plan::{SharedPlanId, SharedQueryPlan, SharedQueryPlanStatus};
pub use signature::{CanonicalSignatureInference, QuerySignature, SignatureInference};
pub use storage::{
    CoordinatorState, OptimisticStorageHandler, ResourceHolder, ResourceId,
    TwoPhaseLockingStorageHandler,
};
pub use topology::{LinkProperties, Topology, TopologyNode, WorkerId, WorkerType};
pub use update_phase::UpdatePhase;
