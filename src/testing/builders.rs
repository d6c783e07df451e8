//! Fluent builders for test topologies and catalogs.
//!
//! ```
//! use fluxmesh::testing::TestTopologyBuilder;
//!
//! let topology = TestTopologyBuilder::new()
//!     .root(1, 100)
//!     .child(2, 1, 10)
//!     .child(3, 2, 4)
//!     .link(3, 1) // redundant path for failover scenarios
//!     .build();
//! assert_eq!(topology.workers().count(), 3);
//! ```

use crate::catalog::{PhysicalSourceEntry, SourceCatalog};
use crate::schema::Schema;
use crate::topology::{Topology, TopologyNode, WorkerId, WorkerType};

/// Builds a [`Topology`] from numeric worker ids.
#[derive(Default)]
pub struct TestTopologyBuilder {
    topology: Topology,
}

impl TestTopologyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the coordinator root.
    #[must_use]
    pub fn root(mut self, id: u64, slots: u32) -> Self {
        self.topology.set_root(TopologyNode::new(
            WorkerId::new(id),
            WorkerType::Cloud,
            "localhost",
            4000,
            4002,
            slots,
        ));
        self
    }

    /// Add a worker below `parent`.
    ///
    /// # Panics
    ///
    /// Panics when the parent was not added first.
    #[must_use]
    pub fn child(mut self, id: u64, parent: u64, slots: u32) -> Self {
        self.topology
            .add_node_as_child(
                WorkerId::new(parent),
                TopologyNode::new(
                    WorkerId::new(id),
                    WorkerType::Fog,
                    "localhost",
                    4000,
                    4002,
                    slots,
                ),
            )
            .expect("parent registered before child");
        self
    }

    /// Add an extra link `upstream -> downstream` between existing workers.
    ///
    /// # Panics
    ///
    /// Panics when either worker is unknown.
    #[must_use]
    pub fn link(mut self, upstream: u64, downstream: u64) -> Self {
        self.topology
            .add_link(WorkerId::new(upstream), WorkerId::new(downstream))
            .expect("both link ends registered");
        self
    }

    /// Flag a worker as under maintenance.
    ///
    /// # Panics
    ///
    /// Panics when the worker is unknown.
    #[must_use]
    pub fn maintenance(mut self, id: u64) -> Self {
        self.topology
            .node_mut(WorkerId::new(id))
            .expect("worker registered")
            .maintenance = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Topology {
        self.topology
    }
}

/// Builds a [`SourceCatalog`] with one physical source per logical source.
#[derive(Default)]
pub struct TestSourceCatalogBuilder {
    catalog: SourceCatalog,
}

impl TestSourceCatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a logical source with `schema`, hosted on `worker`.
    ///
    /// # Panics
    ///
    /// Panics on duplicate names (a test-setup bug).
    #[must_use]
    pub fn source(mut self, name: &str, schema: Schema, worker: u64) -> Self {
        self.catalog
            .add_logical_source(name, schema)
            .expect("unique logical source name");
        self.catalog
            .add_physical_source(
                name,
                PhysicalSourceEntry {
                    physical_name: format!("physical_{name}"),
                    worker: WorkerId::new(worker),
                },
            )
            .expect("logical source just registered");
        self
    }

    #[must_use]
    pub fn build(self) -> SourceCatalog {
        self.catalog
    }
}
