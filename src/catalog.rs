//! The coordinated catalogs: sources, UDFs, and queries.
//!
//! Catalogs are narrow collaborators of the coordination core. The source
//! catalog maps logical sources to the physical sources (and hosting
//! workers) that feed them; the UDF catalog registers user functions by
//! name; the query catalog tracks the per-query state machine that the
//! update phase and the amenders both advance.
//!
//! All three are process-wide singletons owned by the storage handler
//! (see [`CoordinatorState`](crate::storage::CoordinatorState)); every
//! mutation goes through an acquired resource holder.

use crate::error::CatalogError;
use crate::placement::PlacementStrategy;
use crate::query_plan::QueryId;
use crate::schema::{FieldType, Schema};
use crate::topology::WorkerId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier pattern"));

fn check_identifier(name: &str) -> Result<(), CatalogError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(CatalogError::InvalidIdentifier(name.to_string()))
    }
}

/// One physical source feeding a logical source, hosted on a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalSourceEntry {
    pub physical_name: String,
    pub worker: WorkerId,
}

/// Logical-to-physical source mapping.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceCatalog {
    logical: BTreeMap<String, Schema>,
    physical: BTreeMap<String, Vec<PhysicalSourceEntry>>,
}

impl SourceCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a logical source with its schema.
    ///
    /// # Errors
    ///
    /// Fails on invalid identifiers and duplicate registrations.
    pub fn add_logical_source(
        &mut self,
        name: impl Into<String>,
        schema: Schema,
    ) -> Result<(), CatalogError> {
        let name = name.into();
        check_identifier(&name)?;
        if self.logical.contains_key(&name) {
            return Err(CatalogError::DuplicateLogicalSource(name));
        }
        self.logical.insert(name, schema);
        Ok(())
    }

    /// Attach a physical source to a registered logical source.
    ///
    /// # Errors
    ///
    /// Fails with [`CatalogError::UnknownLogicalSource`] if the logical
    /// source is not registered.
    pub fn add_physical_source(
        &mut self,
        logical: &str,
        entry: PhysicalSourceEntry,
    ) -> Result<(), CatalogError> {
        if !self.logical.contains_key(logical) {
            return Err(CatalogError::UnknownLogicalSource(logical.to_string()));
        }
        self.physical.entry(logical.to_string()).or_default().push(entry);
        Ok(())
    }

    /// Schema of a logical source.
    #[must_use]
    pub fn schema_of(&self, logical: &str) -> Option<&Schema> {
        self.logical.get(logical)
    }

    #[must_use]
    pub fn contains(&self, logical: &str) -> bool {
        self.logical.contains_key(logical)
    }

    /// Workers hosting physical sources of a logical source.
    #[must_use]
    pub fn workers_hosting(&self, logical: &str) -> Vec<WorkerId> {
        self.physical
            .get(logical)
            .map(|entries| entries.iter().map(|e| e.worker).collect())
            .unwrap_or_default()
    }

    /// True if any physical source lives on the worker.
    #[must_use]
    pub fn worker_hosts_sources(&self, worker: WorkerId) -> bool {
        self.physical
            .values()
            .any(|entries| entries.iter().any(|e| e.worker == worker))
    }

    /// All workers hosting any physical source.
    #[must_use]
    pub fn source_workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self
            .physical
            .values()
            .flat_map(|entries| entries.iter().map(|e| e.worker))
            .collect();
        workers.sort_unstable();
        workers.dedup();
        workers
    }
}

/// A registered user-defined function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfDescriptor {
    pub name: String,
    pub input_types: Vec<FieldType>,
    pub output_type: FieldType,
}

/// Registry of user-defined functions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UdfCatalog {
    udfs: BTreeMap<String, UdfDescriptor>,
}

impl UdfCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a UDF.
    ///
    /// # Errors
    ///
    /// Fails on invalid identifiers and duplicate names.
    pub fn register(&mut self, descriptor: UdfDescriptor) -> Result<(), CatalogError> {
        check_identifier(&descriptor.name)?;
        if self.udfs.contains_key(&descriptor.name) {
            return Err(CatalogError::DuplicateUdf(descriptor.name));
        }
        self.udfs.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&UdfDescriptor> {
        self.udfs.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.udfs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.udfs.is_empty()
    }
}

/// Lifecycle of a registered query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    /// Accepted by the coordinator, not yet planned.
    #[default]
    Registered,
    /// Inside the update phase or awaiting an amendment.
    Optimizing,
    /// Deployed and producing results.
    Running,
    /// Stop requested; the stop amendment has not committed yet.
    MarkedForStop,
    Stopped,
    Failed,
}

/// Catalog entry of one query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryCatalogEntry {
    pub query_id: QueryId,
    pub state: QueryState,
    pub placement_strategy: PlacementStrategy,
    pub registered_at_micros: u64,
}

/// Registry of queries and their states.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryCatalog {
    entries: BTreeMap<QueryId, QueryCatalogEntry>,
}

impl QueryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new query in state [`QueryState::Registered`].
    ///
    /// # Errors
    ///
    /// Fails with [`CatalogError::DuplicateQuery`] if the id is taken.
    pub fn register(
        &mut self,
        query_id: QueryId,
        placement_strategy: PlacementStrategy,
    ) -> Result<(), CatalogError> {
        if self.entries.contains_key(&query_id) {
            return Err(CatalogError::DuplicateQuery(query_id));
        }
        self.entries.insert(
            query_id,
            QueryCatalogEntry {
                query_id,
                state: QueryState::Registered,
                placement_strategy,
                registered_at_micros: crate::utils::now_micros(),
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn state_of(&self, query_id: QueryId) -> Option<QueryState> {
        self.entries.get(&query_id).map(|e| e.state)
    }

    /// Advance a query's state.
    ///
    /// # Errors
    ///
    /// Fails with [`CatalogError::UnknownQuery`] for unregistered ids.
    pub fn set_state(&mut self, query_id: QueryId, state: QueryState) -> Result<(), CatalogError> {
        let entry = self
            .entries
            .get_mut(&query_id)
            .ok_or(CatalogError::UnknownQuery(query_id))?;
        entry.state = state;
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, query_id: QueryId) -> bool {
        self.entries.contains_key(&query_id)
    }

    /// All registered queries, in id order.
    pub fn queries(&self) -> impl Iterator<Item = &QueryCatalogEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn get(&self, query_id: QueryId) -> Option<&QueryCatalogEntry> {
        self.entries.get(&query_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
