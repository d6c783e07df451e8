//! Storage handlers: coordinated access to the process-wide resources.
//!
//! The topology, the global query/execution plans, and the catalogs are
//! conceptually process-wide singletons. [`CoordinatorState`] owns them
//! (created at coordinator start, dropped at stop); every access goes
//! through one of the two handlers:
//!
//! - [`TwoPhaseLockingStorageHandler`] -- `acquire` takes write locks in the
//!   canonical resource order ([`ResourceId`]'s `Ord`), which precludes
//!   deadlock; the returned [`ResourceHolder`] releases in reverse order on
//!   drop. Acquisition uses timed lock attempts and bounded retries.
//! - [`OptimisticStorageHandler`] -- `snapshot` records per-resource
//!   versions, the amender computes against clones, and
//!   `validate_and_commit` re-locks, compares every watched version, and
//!   applies the changes in one short critical section.
//!
//! Version bumping happens while the write locks are still held, so a
//! snapshot taken after a release always observes the new version.

use crate::catalog::{QueryCatalog, SourceCatalog, UdfCatalog};
use crate::error::StorageError;
use crate::execution_plan::GlobalExecutionPlan;
use crate::global_plan::GlobalQueryPlan;
use crate::topology::Topology;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

type ArcWriteGuard<T> = ArcRwLockWriteGuard<RawRwLock, T>;

/// The coordinated resources, in canonical lock order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceId {
    Topology,
    GlobalQueryPlan,
    GlobalExecutionPlan,
    SourceCatalog,
    UdfCatalog,
    QueryCatalog,
}

impl ResourceId {
    /// Every resource, in canonical order.
    pub const ALL: [ResourceId; 6] = [
        ResourceId::Topology,
        ResourceId::GlobalQueryPlan,
        ResourceId::GlobalExecutionPlan,
        ResourceId::SourceCatalog,
        ResourceId::UdfCatalog,
        ResourceId::QueryCatalog,
    ];
}

/// Per-resource modification counters consulted by OCC validation.
#[derive(Debug, Default)]
pub struct ResourceVersions {
    counters: [AtomicU64; 6],
}

impl ResourceVersions {
    fn index(resource: ResourceId) -> usize {
        ResourceId::ALL
            .iter()
            .position(|r| *r == resource)
            .expect("resource in canonical list")
    }

    /// Current version of a resource.
    #[must_use]
    pub fn get(&self, resource: ResourceId) -> u64 {
        self.counters[Self::index(resource)].load(Ordering::Acquire)
    }

    fn bump(&self, resource: ResourceId) {
        self.counters[Self::index(resource)].fetch_add(1, Ordering::AcqRel);
    }
}

/// Owner of the process-wide coordinated resources.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct CoordinatorState {
    topology: Arc<RwLock<Topology>>,
    global_query_plan: Arc<RwLock<GlobalQueryPlan>>,
    global_execution_plan: Arc<RwLock<GlobalExecutionPlan>>,
    source_catalog: Arc<RwLock<SourceCatalog>>,
    udf_catalog: Arc<RwLock<UdfCatalog>>,
    query_catalog: Arc<RwLock<QueryCatalog>>,
    versions: Arc<ResourceVersions>,
    #[cfg(feature = "metrics")]
    metrics: crate::metrics::MetricsCollector,
}

impl CoordinatorState {
    /// Initialize the coordinated state with a topology and source catalog;
    /// the plans and remaining catalogs start empty.
    #[must_use]
    pub fn new(topology: Topology, source_catalog: SourceCatalog) -> Self {
        Self {
            topology: Arc::new(RwLock::new(topology)),
            global_query_plan: Arc::new(RwLock::new(GlobalQueryPlan::new())),
            global_execution_plan: Arc::new(RwLock::new(GlobalExecutionPlan::new())),
            source_catalog: Arc::new(RwLock::new(source_catalog)),
            udf_catalog: Arc::new(RwLock::new(UdfCatalog::new())),
            query_catalog: Arc::new(RwLock::new(QueryCatalog::new())),
            versions: Arc::new(ResourceVersions::default()),
            #[cfg(feature = "metrics")]
            metrics: crate::metrics::MetricsCollector::new(),
        }
    }

    /// Read access to the topology (inspection; mutations go through a
    /// handler).
    #[must_use]
    pub fn read_topology(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read()
    }

    #[must_use]
    pub fn read_global_query_plan(&self) -> RwLockReadGuard<'_, GlobalQueryPlan> {
        self.global_query_plan.read()
    }

    #[must_use]
    pub fn read_global_execution_plan(&self) -> RwLockReadGuard<'_, GlobalExecutionPlan> {
        self.global_execution_plan.read()
    }

    #[must_use]
    pub fn read_source_catalog(&self) -> RwLockReadGuard<'_, SourceCatalog> {
        self.source_catalog.read()
    }

    #[must_use]
    pub fn read_udf_catalog(&self) -> RwLockReadGuard<'_, UdfCatalog> {
        self.udf_catalog.read()
    }

    #[must_use]
    pub fn read_query_catalog(&self) -> RwLockReadGuard<'_, QueryCatalog> {
        self.query_catalog.read()
    }

    /// The per-resource version counters.
    #[must_use]
    pub fn versions(&self) -> &ResourceVersions {
        &self.versions
    }

    /// The process-wide metrics collector.
    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn metrics(&self) -> &crate::metrics::MetricsCollector {
        &self.metrics
    }

    fn write_guard_for(
        &self,
        resource: ResourceId,
        timeout: Option<Duration>,
    ) -> Option<ResourceGuard> {
        macro_rules! take {
            ($lock:expr, $variant:ident) => {
                match timeout {
                    Some(t) => $lock.try_write_arc_for(t).map(ResourceGuard::$variant),
                    None => Some(ResourceGuard::$variant($lock.write_arc())),
                }
            };
        }
        match resource {
            ResourceId::Topology => take!(self.topology, Topology),
            ResourceId::GlobalQueryPlan => take!(self.global_query_plan, GlobalQueryPlan),
            ResourceId::GlobalExecutionPlan => {
                take!(self.global_execution_plan, GlobalExecutionPlan)
            }
            ResourceId::SourceCatalog => take!(self.source_catalog, SourceCatalog),
            ResourceId::UdfCatalog => take!(self.udf_catalog, UdfCatalog),
            ResourceId::QueryCatalog => take!(self.query_catalog, QueryCatalog),
        }
    }
}

enum ResourceGuard {
    Topology(ArcWriteGuard<Topology>),
    GlobalQueryPlan(ArcWriteGuard<GlobalQueryPlan>),
    GlobalExecutionPlan(ArcWriteGuard<GlobalExecutionPlan>),
    SourceCatalog(ArcWriteGuard<SourceCatalog>),
    UdfCatalog(ArcWriteGuard<UdfCatalog>),
    QueryCatalog(ArcWriteGuard<QueryCatalog>),
}

/// Write access to an acquired set of resources.
///
/// Dropping the holder bumps the version of every resource that was borrowed
/// mutably (while the locks are still held) and then releases the locks in
/// reverse acquisition order.
pub struct ResourceHolder {
    guards: Vec<(ResourceId, ResourceGuard)>,
    versions: Arc<ResourceVersions>,
    dirty: BTreeSet<ResourceId>,
}

macro_rules! holder_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        /// Shared access to the acquired resource.
        ///
        /// # Panics
        ///
        /// Panics if the resource was not part of the acquisition.
        #[must_use]
        pub fn $get(&self) -> &$ty {
            for (_, guard) in &self.guards {
                if let ResourceGuard::$variant(g) = guard {
                    return g;
                }
            }
            panic!("{:?} was not acquired", ResourceId::$variant)
        }

        /// Mutable access to the acquired resource; marks it dirty so its
        /// version is bumped on release.
        ///
        /// # Panics
        ///
        /// Panics if the resource was not part of the acquisition.
        #[must_use]
        pub fn $get_mut(&mut self) -> &mut $ty {
            self.dirty.insert(ResourceId::$variant);
            for (_, guard) in &mut self.guards {
                if let ResourceGuard::$variant(g) = guard {
                    return g;
                }
            }
            panic!("{:?} was not acquired", ResourceId::$variant)
        }
    };
}

impl ResourceHolder {
    holder_accessors!(topology, topology_mut, Topology, Topology);
    holder_accessors!(
        global_query_plan,
        global_query_plan_mut,
        GlobalQueryPlan,
        GlobalQueryPlan
    );
    holder_accessors!(
        global_execution_plan,
        global_execution_plan_mut,
        GlobalExecutionPlan,
        GlobalExecutionPlan
    );
    holder_accessors!(source_catalog, source_catalog_mut, SourceCatalog, SourceCatalog);
    holder_accessors!(udf_catalog, udf_catalog_mut, UdfCatalog, UdfCatalog);
    holder_accessors!(query_catalog, query_catalog_mut, QueryCatalog, QueryCatalog);

    /// Ids of the resources this holder grants access to.
    #[must_use]
    pub fn acquired(&self) -> Vec<ResourceId> {
        self.guards.iter().map(|(id, _)| *id).collect()
    }
}

impl Drop for ResourceHolder {
    fn drop(&mut self) {
        // Bump before releasing so post-release snapshots see the change.
        for resource in &self.dirty {
            self.versions.bump(*resource);
        }
        while self.guards.pop().is_some() {}
    }
}

/// Pessimistic (2PL) storage handler.
pub struct TwoPhaseLockingStorageHandler {
    state: CoordinatorState,
    lock_timeout: Duration,
    lock_retry_count: u32,
}

impl TwoPhaseLockingStorageHandler {
    #[must_use]
    pub fn new(state: CoordinatorState, lock_timeout: Duration, lock_retry_count: u32) -> Self {
        Self {
            state,
            lock_timeout,
            lock_retry_count,
        }
    }

    /// Acquire write access to the given resources, always in canonical
    /// order regardless of the order requested.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::LockTimeout`] after the configured number
    /// of timed attempts on any single resource; everything acquired so far
    /// is released.
    pub fn acquire(&self, resources: &[ResourceId]) -> Result<ResourceHolder, StorageError> {
        let ordered: BTreeSet<ResourceId> = resources.iter().copied().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for resource in ordered {
            let mut guard = None;
            for attempt in 0..=self.lock_retry_count {
                if let Some(g) = self.state.write_guard_for(resource, Some(self.lock_timeout)) {
                    guard = Some(g);
                    break;
                }
                warn!(?resource, attempt, "lock acquisition timed out, retrying");
            }
            match guard {
                Some(g) => guards.push((resource, g)),
                None => return Err(StorageError::LockTimeout(resource)),
            }
        }
        Ok(ResourceHolder {
            guards,
            versions: Arc::clone(&self.state.versions),
            dirty: BTreeSet::new(),
        })
    }
}

/// Versions observed by an optimistic amender at snapshot time.
#[derive(Clone, Debug)]
pub struct OccSnapshot {
    versions: BTreeMap<ResourceId, u64>,
}

impl OccSnapshot {
    /// Resources this snapshot watches, in canonical order.
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceId> {
        self.versions.keys().copied().collect()
    }
}

/// Optimistic (OCC) storage handler.
pub struct OptimisticStorageHandler {
    state: CoordinatorState,
}

impl OptimisticStorageHandler {
    #[must_use]
    pub fn new(state: CoordinatorState) -> Self {
        Self { state }
    }

    /// Record the current versions of the given resources. Take the
    /// snapshot *before* cloning any data so a concurrent commit is always
    /// caught by validation.
    #[must_use]
    pub fn snapshot(&self, resources: &[ResourceId]) -> OccSnapshot {
        OccSnapshot {
            versions: resources
                .iter()
                .map(|r| (*r, self.state.versions.get(*r)))
                .collect(),
        }
    }

    /// Re-lock the watched resources in canonical order, verify that no
    /// version moved since the snapshot, and run `apply` inside the critical
    /// section. Dirty resources get their versions bumped on release.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::ValidationConflict`] naming the first
    /// resource whose version changed; nothing is applied in that case.
    pub fn validate_and_commit<R>(
        &self,
        snapshot: &OccSnapshot,
        apply: impl FnOnce(&mut ResourceHolder) -> R,
    ) -> Result<R, StorageError> {
        let mut guards = Vec::with_capacity(snapshot.versions.len());
        for resource in snapshot.versions.keys() {
            let guard = self
                .state
                .write_guard_for(*resource, None)
                .expect("untimed write lock");
            guards.push((*resource, guard));
        }
        let mut holder = ResourceHolder {
            guards,
            versions: Arc::clone(&self.state.versions),
            dirty: BTreeSet::new(),
        };
        for (resource, observed) in &snapshot.versions {
            if self.state.versions.get(*resource) != *observed {
                return Err(StorageError::ValidationConflict(*resource));
            }
        }
        Ok(apply(&mut holder))
    }
}
