//! Error types surfaced by the coordinator core.
//!
//! Batch rejection is an explicit [`UpdateError`] carried in the `Result` of
//! [`UpdatePhase::execute`](crate::update_phase::UpdatePhase::execute): the
//! variant identifies which request caused the rejection, and a rejected
//! batch leaves every coordinated resource untouched.
//!
//! Placement failures ([`PlacementError`]) are contained to the amendment
//! that produced them; the affected shared plan keeps its change-log and
//! stays in the `Optimizing` status so a later batch can retry.

use crate::operator::OperatorId;
use crate::query_plan::QueryId;
use crate::storage::ResourceId;
use crate::topology::WorkerId;
use thiserror::Error;

/// Failure of an update-phase batch. The whole batch is rejected atomically.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The request carried the reserved invalid query id (0).
    #[error("invalid query id {0}")]
    InvalidQueryId(QueryId),

    /// The same query id was submitted more than once in one batch.
    #[error("query {0} appears more than once in the batch")]
    DuplicateQueryInBatch(QueryId),

    /// The query entered the batch in an unrecoverable state.
    #[error("query {0} is in a failed state")]
    QueryInFailedState(QueryId),

    /// An add-query request reused an id that is already registered.
    #[error("query {0} is already registered")]
    QueryAlreadyExists(QueryId),

    /// No shared query plan hosts the referenced query.
    #[error("no shared query plan hosts query {0}")]
    UnknownQuery(QueryId),

    /// The configured merger rule needs signatures but inference could not
    /// provide a complete set. Never silently degraded to another rule.
    #[error("signature unavailable for query {query_id}: {reason}")]
    SignatureUnavailable { query_id: QueryId, reason: String },

    /// Topology-mutation requests were submitted while
    /// `enable_query_reconfiguration` is off.
    #[error("query reconfiguration is disabled")]
    ReconfigurationDisabled,

    /// A request referenced a worker the topology does not know.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// A request referenced a link the topology does not know.
    #[error("no link between workers {0} and {1}")]
    UnknownLink(WorkerId, WorkerId),

    /// Removing the worker would disconnect source-hosting workers from the
    /// coordinator root.
    #[error("removing worker {0} would orphan source-hosting workers")]
    WouldOrphanSources(WorkerId),

    /// A query plan referenced a logical source the catalog does not know.
    #[error("unknown logical source '{0}'")]
    UnknownSource(String),

    /// Schema propagation failed while annotating a query plan.
    #[error("schema mismatch at operator {operator}: {detail}")]
    SchemaMismatch { operator: OperatorId, detail: String },

    /// Internal merger failure (malformed candidate, inference timeout).
    #[error("query merger failure: {0}")]
    MergerFailure(String),

    /// Resource acquisition failed after internal retries.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure of a placement computation.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// No data path exists between the two workers.
    #[error("no path between workers {0} and {1}")]
    NoPathBetween(WorkerId, WorkerId),

    /// No candidate worker had enough free slots for the operator.
    #[error("worker {worker} has {available} free slots, operator {operator} needs {needed}")]
    InsufficientCapacity {
        worker: WorkerId,
        operator: OperatorId,
        needed: u32,
        available: u32,
    },

    /// Manual placement requires every operator to carry a pinned worker.
    #[error("operator {0} has no pinned worker")]
    MissingPin(OperatorId),

    /// A pinned worker does not exist in the topology.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
}

/// Failure inside the storage handlers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A 2PL write lock could not be taken within the configured timeout.
    #[error("timed out acquiring {0:?}")]
    LockTimeout(ResourceId),

    /// OCC validation observed a version change since the snapshot.
    #[error("optimistic validation failed on {0:?}")]
    ValidationConflict(ResourceId),

    /// The amendment handler no longer accepts work.
    #[error("handler is shut down")]
    ShutDown,
}

/// Failure of the signature-inference collaborator.
///
/// An incomplete or unavailable signature is surfaced explicitly; the merger
/// never silently falls back to another rule.
#[derive(Debug, Error)]
#[error("signature inference failed: {0}")]
pub struct SignatureError(pub String);

/// Failure of a catalog mutation.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Logical source and UDF names must be valid identifiers.
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    /// The logical source is already registered.
    #[error("logical source '{0}' already exists")]
    DuplicateLogicalSource(String),

    /// A physical source referenced an unregistered logical source.
    #[error("unknown logical source '{0}'")]
    UnknownLogicalSource(String),

    /// The UDF is already registered.
    #[error("udf '{0}' already exists")]
    DuplicateUdf(String),

    /// The query is not registered in the query catalog.
    #[error("query {0} is not registered")]
    UnknownQuery(QueryId),

    /// The query is already registered in the query catalog.
    #[error("query {0} is already registered")]
    DuplicateQuery(QueryId),
}
