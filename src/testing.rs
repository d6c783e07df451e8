//! Testing utilities for Fluxmesh coordinators.
//!
//! This module provides the facility end-users (and the crate's own tests)
//! use to write idiomatic Rust tests against the coordination core:
//!
//! - **Assertions**: compare operator states, change-log boundaries, and
//!   hosted-query sets with readable failure messages
//! - **Builders**: construct test topologies and source catalogs fluently
//! - **Fixtures**: the standard six-worker test topology and its catalogs
//!
//! # Quick Start
//!
//! ```no_run
//! use fluxmesh::*;
//! use fluxmesh::testing::*;
//!
//! #[test]
//! fn single_query_deploys() -> anyhow::Result<()> {
//!     let state = coordinator_state();
//!     let phase = UpdatePhase::new(state.clone(), test_config());
//!
//!     let plan = Query::from("source1")
//!         .sink(SinkDescriptor::Print)
//!         .with_query_id(QueryId::new(1));
//!     phase.execute(vec![Request::AddQuery(AddQueryRequest::new(
//!         plan,
//!         PlacementStrategy::BottomUp,
//!     ))])?;
//!
//!     let global = state.read_global_query_plan();
//!     assert_eq!(global.shared_plans_to_deploy().len(), 1);
//!     Ok(())
//! }
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;

pub use assertions::*;
pub use builders::*;
pub use fixtures::*;
