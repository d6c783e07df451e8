//! The worker topology: a rooted, directed acyclic graph of workers.
//!
//! This module defines:
//! - [`WorkerId`]: opaque numeric worker identity.
//! - [`TopologyNode`]: one worker -- address, resource slots, node properties,
//!   and its parent/child neighbor sets (ids, not pointers).
//! - [`Topology`]: the graph itself, with link properties, slot accounting,
//!   and the path queries the placement strategies rely on.
//!
//! Orientation follows the data flow: *upstream* workers (children) are on
//! the source side, *downstream* workers (parents) are toward the single
//! root, which is the coordinator node. Links are stored per
//! (upstream, downstream) pair together with their [`LinkProperties`].
//!
//! # Notes
//! * Path queries walk **upward** (child to parent) only; a data path always
//!   climbs toward the root.
//! * When a worker has several parents, [`Topology::find_path_between`]
//!   prefers the route with the lowest total link latency (ties resolved
//!   deterministically by worker id).
//! * Removal preserves connectedness by contract: the update phase refuses
//!   removals that would orphan source-hosting workers (see
//!   [`UpdatePhase`](crate::update_phase::UpdatePhase)).

use crate::error::{PlacementError, UpdateError};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::fmt;

/// Unique numeric identifier for a worker in the topology.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Create a `WorkerId` from an externally assigned worker number.
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Coarse class of a worker, carried by node-registration events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerType {
    Cloud,
    #[default]
    Fog,
    Sensor,
}

/// Typed properties of a topology link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkProperties {
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
}

impl LinkProperties {
    #[must_use]
    pub fn new(bandwidth_mbps: f64, latency_ms: f64) -> Self {
        Self {
            bandwidth_mbps,
            latency_ms,
        }
    }
}

/// One worker of the topology.
///
/// Neighbor relationships are stored as id sets; the owning [`Topology`] is
/// the only place that resolves them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyNode {
    pub id: WorkerId,
    pub worker_type: WorkerType,
    pub host: String,
    pub grpc_port: u16,
    pub data_port: u16,
    total_slots: u32,
    occupied_slots: u32,
    /// Workers under maintenance are skipped by placement strategies.
    pub maintenance: bool,
    pub spatial_support: bool,
    /// Free-form extra properties.
    pub properties: BTreeMap<String, String>,
    parents: BTreeSet<WorkerId>,
    children: BTreeSet<WorkerId>,
}

impl TopologyNode {
    /// Create a worker description with the given resource capacity.
    #[must_use]
    pub fn new(
        id: WorkerId,
        worker_type: WorkerType,
        host: impl Into<String>,
        grpc_port: u16,
        data_port: u16,
        total_slots: u32,
    ) -> Self {
        Self {
            id,
            worker_type,
            host: host.into(),
            grpc_port,
            data_port,
            total_slots,
            occupied_slots: 0,
            maintenance: false,
            spatial_support: false,
            properties: BTreeMap::new(),
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    /// Builder-style maintenance flag.
    #[must_use]
    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    #[must_use]
    pub fn total_slots(&self) -> u32 {
        self.total_slots
    }

    #[must_use]
    pub fn occupied_slots(&self) -> u32 {
        self.occupied_slots
    }

    /// Slots still available on this worker.
    #[must_use]
    pub fn remaining_slots(&self) -> u32 {
        self.total_slots.saturating_sub(self.occupied_slots)
    }

    /// Downstream neighbors (toward the root).
    #[must_use]
    pub fn parents(&self) -> &BTreeSet<WorkerId> {
        &self.parents
    }

    /// Upstream neighbors (toward the sources).
    #[must_use]
    pub fn children(&self) -> &BTreeSet<WorkerId> {
        &self.children
    }
}

/// The rooted worker graph.
///
/// The root is the coordinator node; every data path terminates there.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Topology {
    nodes: BTreeMap<WorkerId, TopologyNode>,
    root: Option<WorkerId>,
    /// Link properties keyed by (upstream, downstream).
    links: BTreeMap<(WorkerId, WorkerId), LinkProperties>,
}

impl Topology {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `node` as the coordinator root. The first node of every
    /// topology must be registered through this.
    pub fn set_root(&mut self, node: TopologyNode) {
        self.root = Some(node.id);
        self.nodes.insert(node.id, node);
    }

    /// The coordinator root, if the topology is non-empty.
    #[must_use]
    pub fn root(&self) -> Option<WorkerId> {
        self.root
    }

    /// Register a worker without connecting it. Use [`Topology::add_link`]
    /// to wire it up, or [`Topology::add_node_as_child`] to do both at once.
    pub fn add_node(&mut self, node: TopologyNode) {
        self.nodes.insert(node.id, node);
    }

    /// Register `node` and link it below `parent` in one step.
    ///
    /// # Errors
    ///
    /// Fails with [`UpdateError::UnknownWorker`] if `parent` is not known.
    pub fn add_node_as_child(
        &mut self,
        parent: WorkerId,
        node: TopologyNode,
    ) -> Result<(), UpdateError> {
        if !self.nodes.contains_key(&parent) {
            return Err(UpdateError::UnknownWorker(parent));
        }
        let child = node.id;
        self.nodes.insert(child, node);
        self.add_link(child, parent)
    }

    /// Create a link from `upstream` (source side) to `downstream` (root
    /// side) with default properties.
    ///
    /// # Errors
    ///
    /// Fails with [`UpdateError::UnknownWorker`] if either end is not known.
    pub fn add_link(&mut self, upstream: WorkerId, downstream: WorkerId) -> Result<(), UpdateError> {
        if !self.nodes.contains_key(&upstream) {
            return Err(UpdateError::UnknownWorker(upstream));
        }
        if !self.nodes.contains_key(&downstream) {
            return Err(UpdateError::UnknownWorker(downstream));
        }
        self.links
            .entry((upstream, downstream))
            .or_insert_with(LinkProperties::default);
        if let Some(up) = self.nodes.get_mut(&upstream) {
            up.parents.insert(downstream);
        }
        if let Some(down) = self.nodes.get_mut(&downstream) {
            down.children.insert(upstream);
        }
        Ok(())
    }

    /// Attach properties to an existing link. Accepts either end order.
    ///
    /// # Errors
    ///
    /// Fails with [`UpdateError::UnknownLink`] if no link connects the two.
    pub fn set_link_properties(
        &mut self,
        a: WorkerId,
        b: WorkerId,
        properties: LinkProperties,
    ) -> Result<(), UpdateError> {
        let key = self.link_key(a, b).ok_or(UpdateError::UnknownLink(a, b))?;
        self.links.insert(key, properties);
        Ok(())
    }

    /// True if a link connects the two workers, in either orientation.
    #[must_use]
    pub fn has_link(&self, a: WorkerId, b: WorkerId) -> bool {
        self.link_key(a, b).is_some()
    }

    /// Properties of the link between the two workers, if any.
    #[must_use]
    pub fn link_properties(&self, a: WorkerId, b: WorkerId) -> Option<LinkProperties> {
        self.link_key(a, b).and_then(|k| self.links.get(&k)).copied()
    }

    /// Remove the link between the two workers (either orientation).
    ///
    /// # Errors
    ///
    /// Fails with [`UpdateError::UnknownLink`] if no such link exists.
    pub fn remove_link(&mut self, a: WorkerId, b: WorkerId) -> Result<LinkProperties, UpdateError> {
        let key = self.link_key(a, b).ok_or(UpdateError::UnknownLink(a, b))?;
        let props = self.links.remove(&key).unwrap_or_default();
        let (upstream, downstream) = key;
        if let Some(up) = self.nodes.get_mut(&upstream) {
            up.parents.remove(&downstream);
        }
        if let Some(down) = self.nodes.get_mut(&downstream) {
            down.children.remove(&upstream);
        }
        Ok(props)
    }

    /// Remove a worker and every link touching it.
    ///
    /// # Errors
    ///
    /// Fails with [`UpdateError::UnknownWorker`] for unknown ids and with
    /// [`UpdateError::WouldOrphanSources`] when asked to remove the root.
    pub fn remove_node(&mut self, id: WorkerId) -> Result<TopologyNode, UpdateError> {
        if self.root == Some(id) {
            return Err(UpdateError::WouldOrphanSources(id));
        }
        let node = self.nodes.remove(&id).ok_or(UpdateError::UnknownWorker(id))?;
        for parent in &node.parents {
            self.links.remove(&(id, *parent));
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.remove(&id);
            }
        }
        for child in &node.children {
            self.links.remove(&(*child, id));
            if let Some(c) = self.nodes.get_mut(child) {
                c.parents.remove(&id);
            }
        }
        Ok(node)
    }

    #[must_use]
    pub fn node(&self, id: WorkerId) -> Option<&TopologyNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn node_mut(&mut self, id: WorkerId) -> Option<&mut TopologyNode> {
        self.nodes.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: WorkerId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Ids of all registered workers.
    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.nodes.keys().copied()
    }

    /// Downstream neighbors of a worker.
    #[must_use]
    pub fn parents_of(&self, id: WorkerId) -> Vec<WorkerId> {
        self.nodes
            .get(&id)
            .map(|n| n.parents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Slots still available on a worker (0 for unknown workers).
    #[must_use]
    pub fn remaining_slots(&self, id: WorkerId) -> u32 {
        self.nodes.get(&id).map_or(0, TopologyNode::remaining_slots)
    }

    /// Account `n` slots as occupied on a worker.
    ///
    /// # Errors
    ///
    /// Fails with [`PlacementError::UnknownWorker`] for unknown ids. Callers
    /// check capacity before occupying; exceeding it saturates at full.
    pub fn occupy_slots(&mut self, id: WorkerId, n: u32) -> Result<(), PlacementError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(PlacementError::UnknownWorker(id))?;
        node.occupied_slots = node.occupied_slots.saturating_add(n).min(node.total_slots);
        Ok(())
    }

    /// Release `n` previously occupied slots on a worker. Unknown workers
    /// (already removed from the graph) are ignored.
    pub fn release_slots(&mut self, id: WorkerId, n: u32) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.occupied_slots = node.occupied_slots.saturating_sub(n);
        }
    }

    /// The lowest-latency upward path from `from` to `to`, inclusive.
    ///
    /// Returns `None` when `to` is not reachable by climbing parent links.
    #[must_use]
    pub fn find_path_between(&self, from: WorkerId, to: WorkerId) -> Option<Vec<WorkerId>> {
        if from == to {
            return self.contains(from).then(|| vec![from]);
        }
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        // Dijkstra over total latency, following parent edges only.
        let mut best: HashMap<WorkerId, (OrderedFloat<f64>, Option<WorkerId>)> = HashMap::new();
        let mut heap = BinaryHeap::new();
        best.insert(from, (OrderedFloat(0.0), None));
        heap.push(Reverse((OrderedFloat(0.0), from)));
        while let Some(Reverse((cost, current))) = heap.pop() {
            if current == to {
                break;
            }
            if best.get(&current).is_some_and(|(c, _)| *c < cost) {
                continue;
            }
            for parent in self.parents_of(current) {
                let props = self
                    .links
                    .get(&(current, parent))
                    .copied()
                    .unwrap_or_default();
                let next_cost = cost + OrderedFloat(props.latency_ms.max(0.0));
                let better = match best.get(&parent) {
                    Some((existing, _)) => next_cost < *existing,
                    None => true,
                };
                if better {
                    best.insert(parent, (next_cost, Some(current)));
                    heap.push(Reverse((next_cost, parent)));
                }
            }
        }
        best.contains_key(&to).then(|| {
            let mut path = vec![to];
            let mut cursor = to;
            while let Some((_, Some(prev))) = best.get(&cursor) {
                path.push(*prev);
                cursor = *prev;
            }
            path.reverse();
            path
        })
    }

    /// Every simple upward path from `from` to `to` that avoids the workers
    /// in `exclude`. Returns an empty list when none exists.
    #[must_use]
    pub fn find_all_paths_between(
        &self,
        from: WorkerId,
        to: WorkerId,
        exclude: &BTreeSet<WorkerId>,
    ) -> Vec<Vec<WorkerId>> {
        let mut paths = Vec::new();
        if exclude.contains(&from) || exclude.contains(&to) {
            return paths;
        }
        let mut stack = vec![from];
        self.collect_paths(from, to, exclude, &mut stack, &mut paths);
        paths
    }

    fn collect_paths(
        &self,
        current: WorkerId,
        to: WorkerId,
        exclude: &BTreeSet<WorkerId>,
        stack: &mut Vec<WorkerId>,
        out: &mut Vec<Vec<WorkerId>>,
    ) {
        if current == to {
            out.push(stack.clone());
            return;
        }
        for parent in self.parents_of(current) {
            if exclude.contains(&parent) || stack.contains(&parent) {
                continue;
            }
            stack.push(parent);
            self.collect_paths(parent, to, exclude, stack, out);
            stack.pop();
        }
    }

    /// The closest common ancestor of the given workers: the deepest worker
    /// that lies on an upward path from every one of them. A worker counts
    /// as its own ancestor.
    #[must_use]
    pub fn find_common_ancestor(&self, workers: &[WorkerId]) -> Option<WorkerId> {
        let mut iter = workers.iter();
        let first = *iter.next()?;
        let mut common = self.ancestors_of(first);
        for worker in iter {
            let ancestors = self.ancestors_of(*worker);
            common.retain(|id| ancestors.contains(id));
        }
        common
            .into_iter()
            .max_by_key(|id| self.depth_of(*id).unwrap_or(0))
    }

    /// All ancestors of a worker (including itself).
    fn ancestors_of(&self, id: WorkerId) -> BTreeSet<WorkerId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if seen.insert(current) {
                queue.extend(self.parents_of(current));
            }
        }
        seen
    }

    /// Hop distance from the root (0 for the root itself).
    fn depth_of(&self, id: WorkerId) -> Option<usize> {
        let root = self.root?;
        let mut depth = HashMap::from([(root, 0usize)]);
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            if current == id {
                return depth.get(&id).copied();
            }
            let d = depth[&current];
            if let Some(node) = self.nodes.get(&current) {
                for child in &node.children {
                    if !depth.contains_key(child) {
                        depth.insert(*child, d + 1);
                        queue.push_back(*child);
                    }
                }
            }
        }
        depth.get(&id).copied()
    }

    /// True if `worker` can still reach the root when `skip_worker` and
    /// `skip_link` are ignored. Used for orphan checks before removals.
    #[must_use]
    pub fn connects_to_root_without(
        &self,
        worker: WorkerId,
        skip_worker: Option<WorkerId>,
        skip_link: Option<(WorkerId, WorkerId)>,
    ) -> bool {
        let Some(root) = self.root else {
            return false;
        };
        if Some(worker) == skip_worker {
            return false;
        }
        let blocked = |a: WorkerId, b: WorkerId| {
            skip_link.is_some_and(|(x, y)| (a == x && b == y) || (a == y && b == x))
        };
        let mut seen = BTreeSet::from([worker]);
        let mut queue = VecDeque::from([worker]);
        while let Some(current) = queue.pop_front() {
            if current == root {
                return true;
            }
            for parent in self.parents_of(current) {
                if Some(parent) == skip_worker || blocked(current, parent) {
                    continue;
                }
                if seen.insert(parent) {
                    queue.push_back(parent);
                }
            }
        }
        false
    }

    fn link_key(&self, a: WorkerId, b: WorkerId) -> Option<(WorkerId, WorkerId)> {
        if self.links.contains_key(&(a, b)) {
            Some((a, b))
        } else if self.links.contains_key(&(b, a)) {
            Some((b, a))
        } else {
            None
        }
    }
}
