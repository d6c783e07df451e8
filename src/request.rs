//! The requests a coordination batch is made of.
//!
//! [`Request`] is a tagged union over the four standalone request kinds
//! plus ISQP batches -- ordered event lists that interleave topology
//! mutations (add/remove nodes and links, link properties) with query
//! lifecycle events. Every request carries a request id and a retry budget
//! for transient storage failures.

use crate::placement::PlacementStrategy;
use crate::query_plan::{QueryId, QueryPlan};
use crate::topology::{LinkProperties, TopologyNode, WorkerId};
use crate::utils::IdSequence;
use serde::{Deserialize, Serialize};
use std::fmt;

static NEXT_REQUEST_ID: IdSequence = IdSequence::new();

/// Unique numeric identifier of one request.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Draw a fresh id from the process-wide sequence.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_REQUEST_ID.next())
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Register and deploy a new query.
#[derive(Clone, Debug)]
pub struct AddQueryRequest {
    pub request_id: RequestId,
    pub plan: QueryPlan,
    pub strategy: PlacementStrategy,
    pub retry_count: u32,
}

impl AddQueryRequest {
    #[must_use]
    pub fn new(plan: QueryPlan, strategy: PlacementStrategy) -> Self {
        Self {
            request_id: RequestId::generate(),
            plan,
            strategy,
            retry_count: 0,
        }
    }
}

/// Stop a running query.
#[derive(Clone, Debug)]
pub struct StopQueryRequest {
    pub request_id: RequestId,
    pub query_id: QueryId,
    pub retry_count: u32,
}

impl StopQueryRequest {
    #[must_use]
    pub fn new(query_id: QueryId) -> Self {
        Self {
            request_id: RequestId::generate(),
            query_id,
            retry_count: 0,
        }
    }
}

/// Remove the topology link between two workers (either end order).
#[derive(Clone, Debug)]
pub struct RemoveLinkRequest {
    pub request_id: RequestId,
    pub upstream: WorkerId,
    pub downstream: WorkerId,
    pub retry_count: u32,
}

impl RemoveLinkRequest {
    #[must_use]
    pub fn new(upstream: WorkerId, downstream: WorkerId) -> Self {
        Self {
            request_id: RequestId::generate(),
            upstream,
            downstream,
            retry_count: 0,
        }
    }
}

/// Remove a worker from the topology.
#[derive(Clone, Debug)]
pub struct RemoveNodeRequest {
    pub request_id: RequestId,
    pub worker: WorkerId,
    pub retry_count: u32,
}

impl RemoveNodeRequest {
    #[must_use]
    pub fn new(worker: WorkerId) -> Self {
        Self {
            request_id: RequestId::generate(),
            worker,
            retry_count: 0,
        }
    }
}

/// One event of an ISQP batch, applied in submission order.
#[derive(Clone, Debug)]
pub enum IsqpEvent {
    /// Register a worker (unconnected; follow with `AddLink`).
    AddNode(TopologyNode),
    /// Link `upstream` below `downstream`.
    AddLink {
        upstream: WorkerId,
        downstream: WorkerId,
    },
    /// Attach bandwidth/latency to an existing link.
    AddLinkProperty {
        upstream: WorkerId,
        downstream: WorkerId,
        properties: LinkProperties,
    },
    RemoveLink {
        upstream: WorkerId,
        downstream: WorkerId,
    },
    RemoveNode(WorkerId),
    AddQuery {
        plan: QueryPlan,
        strategy: PlacementStrategy,
    },
    RemoveQuery(QueryId),
}

/// An ISQP batch: an ordered list of topology and query events processed as
/// one transactional request.
#[derive(Clone, Debug)]
pub struct IsqpRequest {
    pub request_id: RequestId,
    pub events: Vec<IsqpEvent>,
    pub retry_count: u32,
}

impl IsqpRequest {
    #[must_use]
    pub fn new(events: Vec<IsqpEvent>) -> Self {
        Self {
            request_id: RequestId::generate(),
            events,
            retry_count: 0,
        }
    }
}

/// A coordination request.
#[derive(Clone, Debug)]
pub enum Request {
    AddQuery(AddQueryRequest),
    StopQuery(StopQueryRequest),
    RemoveLink(RemoveLinkRequest),
    RemoveNode(RemoveNodeRequest),
    Isqp(IsqpRequest),
}

impl Request {
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        match self {
            Request::AddQuery(r) => r.request_id,
            Request::StopQuery(r) => r.request_id,
            Request::RemoveLink(r) => r.request_id,
            Request::RemoveNode(r) => r.request_id,
            Request::Isqp(r) => r.request_id,
        }
    }

    /// True if the request mutates the topology and therefore requires
    /// `enable_query_reconfiguration`.
    #[must_use]
    pub fn mutates_topology(&self) -> bool {
        match self {
            Request::AddQuery(_) | Request::StopQuery(_) => false,
            Request::RemoveLink(_) | Request::RemoveNode(_) => true,
            Request::Isqp(r) => r.events.iter().any(|e| {
                !matches!(e, IsqpEvent::AddQuery { .. } | IsqpEvent::RemoveQuery(_))
            }),
        }
    }
}
