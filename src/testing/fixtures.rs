//! Pre-built fixtures: the standard test topology and catalogs.
//!
//! The six-worker topology used across the integration tests:
//!
//! ```text
//!           1 (root, 100 slots)
//!           |
//!           2 (100)
//!          / \
//!     (10) 3   4 (10)
//!          |   |
//!      (2) 5   6 (2)     <- physical sources live here
//! ```
//!
//! `source1` is hosted on worker 5, `source2` on worker 6.

use crate::config::CoordinatorConfig;
use crate::schema::{FieldType, Schema};
use crate::storage::CoordinatorState;
use crate::topology::Topology;

use super::builders::{TestSourceCatalogBuilder, TestTopologyBuilder};

/// The standard input schema (`f1: Int32`, `f2: Int8`).
#[must_use]
pub fn test_schema() -> Schema {
    Schema::empty()
        .with_field("f1", FieldType::Int32)
        .with_field("f2", FieldType::Int8)
}

/// The six-worker test topology.
#[must_use]
pub fn six_node_topology() -> Topology {
    TestTopologyBuilder::new()
        .root(1, 100)
        .child(2, 1, 100)
        .child(3, 2, 10)
        .child(4, 2, 10)
        .child(5, 3, 2)
        .child(6, 4, 2)
        .build()
}

/// Coordinator state over the six-worker topology with `source1` on worker
/// 5 and `source2` on worker 6.
#[must_use]
pub fn coordinator_state() -> CoordinatorState {
    let catalog = TestSourceCatalogBuilder::new()
        .source("source1", test_schema(), 5)
        .source("source2", test_schema(), 6)
        .build();
    CoordinatorState::new(six_node_topology(), catalog)
}

/// Default test configuration: reconfiguration on, two amender threads.
#[must_use]
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        enable_query_reconfiguration: true,
        placement_amendment_thread_count: 2,
        ..CoordinatorConfig::default()
    }
}
