//! The global-query-plan update phase: transactional batch execution.
//!
//! [`UpdatePhase::execute`] is the entry point for a batch of requests. It
//! acquires the coordinated resources, applies every request **to working
//! clones** in submission order, and commits the clones wholesale on
//! success. Any validation or merge failure rejects the whole batch: the
//! caller observes an [`UpdateError`] and no resource has changed.
//!
//! The pass order per batch is intentional:
//! 1) batch-level validation (duplicates, invalid ids, reconfiguration gate)
//! 2) per-request application (queries mutate the plan forest via the
//!    merger; topology requests compute minimal change-logs first, then
//!    mutate the topology)
//! 3) commit + emission of one placement-amendment instance per dirty
//!    shared plan.
//!
//! Topology-impact analysis scans all shared plans in parallel; it only
//! reads, so the scan is free of coordination.

use crate::amendment::PlacementAmendmentInstance;
use crate::catalog::{QueryCatalog, QueryState, SourceCatalog};
use crate::changelog::ChangeLogEntry;
use crate::config::CoordinatorConfig;
use crate::error::UpdateError;
use crate::execution_plan::GlobalExecutionPlan;
use crate::global_plan::GlobalQueryPlan;
use crate::operator::{OperatorId, OperatorKind, OperatorState};
use crate::placement::PlacementStrategy;
use crate::query_plan::{QueryId, QueryPlan};
use crate::request::{IsqpEvent, Request};
use crate::shared_plan::{SharedPlanId, SharedQueryPlan};
use crate::signature::{CanonicalSignatureInference, SignatureInference, infer_schemas};
use crate::storage::{CoordinatorState, ResourceId, TwoPhaseLockingStorageHandler};
use crate::topology::{Topology, WorkerId};
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Mutable working copies of the resources a batch may touch. Committed
/// wholesale on success, dropped on failure.
struct WorkingSet {
    topology: Topology,
    global_query_plan: GlobalQueryPlan,
    execution_plan: GlobalExecutionPlan,
    query_catalog: QueryCatalog,
    source_catalog: SourceCatalog,
}

/// Dispatches request batches against the global query plan.
pub struct UpdatePhase {
    state: CoordinatorState,
    config: CoordinatorConfig,
    storage: TwoPhaseLockingStorageHandler,
    inference: Box<dyn SignatureInference>,
}

impl UpdatePhase {
    /// Create an update phase with the canonical signature inference.
    #[must_use]
    pub fn new(state: CoordinatorState, config: CoordinatorConfig) -> Self {
        let storage = TwoPhaseLockingStorageHandler::new(
            state.clone(),
            config.lock_timeout,
            config.lock_retry_count,
        );
        Self {
            state,
            config,
            storage,
            inference: Box::new(CanonicalSignatureInference),
        }
    }

    /// Replace the signature-inference collaborator.
    #[must_use]
    pub fn with_signature_inference(mut self, inference: Box<dyn SignatureInference>) -> Self {
        self.inference = inference;
        self
    }

    /// Execute one batch transactionally.
    ///
    /// Returns one [`PlacementAmendmentInstance`] per shared plan left with
    /// a pending change-log (or terminally stopped); the caller enqueues
    /// them into the amendment handler.
    ///
    /// # Errors
    ///
    /// Any validation, merge, or topology failure rejects the batch
    /// atomically.
    pub fn execute(
        &self,
        batch: Vec<Request>,
    ) -> Result<Vec<PlacementAmendmentInstance>, UpdateError> {
        let result = self.execute_inner(batch);
        #[cfg(feature = "metrics")]
        match &result {
            Ok(_) => self.state.metrics().increment("batches_accepted", 1),
            Err(_) => self.state.metrics().increment("batches_rejected", 1),
        }
        result
    }

    fn execute_inner(
        &self,
        batch: Vec<Request>,
    ) -> Result<Vec<PlacementAmendmentInstance>, UpdateError> {
        self.validate_batch(&batch)?;

        let mut holder = self.storage.acquire(&ResourceId::ALL)?;
        let mut work = WorkingSet {
            topology: holder.topology().clone(),
            global_query_plan: holder.global_query_plan().clone(),
            execution_plan: holder.global_execution_plan().clone(),
            query_catalog: holder.query_catalog().clone(),
            source_catalog: holder.source_catalog().clone(),
        };

        let mut merged_queries = 0u64;
        for request in batch {
            let request_id = request.request_id();
            debug!(%request_id, "applying request");
            match request {
                Request::AddQuery(r) => {
                    if self.apply_add_query(&mut work, r.plan, r.strategy)? {
                        merged_queries += 1;
                    }
                }
                Request::StopQuery(r) => Self::apply_stop_query(&mut work, r.query_id)?,
                Request::RemoveLink(r) => {
                    Self::apply_remove_link(&mut work, r.upstream, r.downstream)?;
                }
                Request::RemoveNode(r) => Self::apply_remove_node(&mut work, r.worker)?,
                Request::Isqp(r) => {
                    for event in r.events {
                        if self.apply_isqp_event(&mut work, event)? {
                            merged_queries += 1;
                        }
                    }
                }
            }
        }

        let instances: Vec<PlacementAmendmentInstance> = work
            .global_query_plan
            .shared_plans_to_deploy()
            .into_iter()
            .filter_map(|plan_id| {
                work.global_query_plan.plan(plan_id).map(|plan| {
                    PlacementAmendmentInstance::new(
                        plan_id,
                        plan.placement_strategy(),
                        self.config.placement_amendment_mode,
                        self.config.occ_retry_count,
                    )
                })
            })
            .collect();

        *holder.topology_mut() = work.topology;
        *holder.global_query_plan_mut() = work.global_query_plan;
        *holder.global_execution_plan_mut() = work.execution_plan;
        *holder.query_catalog_mut() = work.query_catalog;
        #[cfg(feature = "metrics")]
        self.state.metrics().increment("queries_merged", merged_queries);
        #[cfg(not(feature = "metrics"))]
        let _ = merged_queries;
        info!(amendments = instances.len(), "batch committed");
        Ok(instances)
    }

    /// Batch-level checks that need no resource access.
    fn validate_batch(&self, batch: &[Request]) -> Result<(), UpdateError> {
        if !self.config.enable_query_reconfiguration
            && batch.iter().any(Request::mutates_topology)
        {
            return Err(UpdateError::ReconfigurationDisabled);
        }
        let mut seen = BTreeSet::new();
        let mut check = |query_id: QueryId| -> Result<(), UpdateError> {
            if !query_id.is_valid() {
                return Err(UpdateError::InvalidQueryId(query_id));
            }
            if !seen.insert(query_id) {
                return Err(UpdateError::DuplicateQueryInBatch(query_id));
            }
            Ok(())
        };
        for request in batch {
            match request {
                Request::AddQuery(r) => check(r.plan.query_id())?,
                Request::Isqp(r) => {
                    for event in &r.events {
                        if let IsqpEvent::AddQuery { plan, .. } = event {
                            check(plan.query_id())?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns true when the query merged into an existing shared plan.
    fn apply_add_query(
        &self,
        work: &mut WorkingSet,
        mut plan: QueryPlan,
        strategy: PlacementStrategy,
    ) -> Result<bool, UpdateError> {
        let query_id = plan.query_id();
        match work.query_catalog.state_of(query_id) {
            Some(QueryState::Failed) => return Err(UpdateError::QueryInFailedState(query_id)),
            Some(_) => return Err(UpdateError::QueryAlreadyExists(query_id)),
            None => {
                work.query_catalog
                    .register(query_id, strategy)
                    .map_err(|e| UpdateError::MergerFailure(e.to_string()))?;
            }
        }
        infer_schemas(plan.dag_mut(), &work.source_catalog)?;
        let plans_before = work.global_query_plan.len();
        work.global_query_plan.add_query_plan(
            plan,
            strategy,
            self.config.query_merger_rule,
            self.inference.as_ref(),
        )?;
        work.query_catalog
            .set_state(query_id, QueryState::Optimizing)
            .map_err(|e| UpdateError::MergerFailure(e.to_string()))?;
        Ok(work.global_query_plan.len() == plans_before)
    }

    fn apply_stop_query(work: &mut WorkingSet, query_id: QueryId) -> Result<(), UpdateError> {
        if work.query_catalog.state_of(query_id) == Some(QueryState::Failed) {
            return Err(UpdateError::QueryInFailedState(query_id));
        }
        let plan_id = work
            .global_query_plan
            .shared_plan_for_query(query_id)
            .ok_or(UpdateError::UnknownQuery(query_id))?;
        work.global_query_plan
            .plan_mut(plan_id)
            .ok_or(UpdateError::UnknownQuery(query_id))?
            .mark_query_stopped(query_id)?;
        work.global_query_plan.unindex_query(query_id);
        work.query_catalog
            .set_state(query_id, QueryState::MarkedForStop)
            .map_err(|_| UpdateError::UnknownQuery(query_id))?;
        Ok(())
    }

    /// Remove a topology link, recording minimal change-logs for every
    /// shared plan whose placement sent data over it.
    fn apply_remove_link(
        work: &mut WorkingSet,
        a: WorkerId,
        b: WorkerId,
    ) -> Result<(), UpdateError> {
        if !work.topology.has_link(a, b) {
            return Err(UpdateError::UnknownLink(a, b));
        }

        // Impact analysis against the pre-removal topology.
        let impacts = Self::link_impacts(work, a, b);
        work.topology.remove_link(a, b)?;
        for (plan_id, entries) in impacts {
            Self::annotate_plan(work, plan_id, entries);
        }
        Ok(())
    }

    /// Remove a topology node. Fails when the node hosts physical sources
    /// or its removal would disconnect source-hosting workers from the
    /// root; otherwise records minimal change-logs for every shared plan
    /// with operators on the node.
    fn apply_remove_node(work: &mut WorkingSet, worker: WorkerId) -> Result<(), UpdateError> {
        if !work.topology.contains(worker) {
            return Err(UpdateError::UnknownWorker(worker));
        }
        if work.topology.root() == Some(worker)
            || work.source_catalog.worker_hosts_sources(worker)
        {
            return Err(UpdateError::WouldOrphanSources(worker));
        }
        for source_worker in work.source_catalog.source_workers() {
            if !work
                .topology
                .connects_to_root_without(source_worker, Some(worker), None)
            {
                return Err(UpdateError::WouldOrphanSources(worker));
            }
        }

        let impacts = Self::node_impacts(work, worker);
        work.execution_plan.remove_worker(worker);
        work.topology.remove_node(worker)?;
        for (plan_id, entries) in impacts {
            Self::annotate_plan(work, plan_id, entries);
        }
        Ok(())
    }

    /// Returns true when the event was an add-query that merged.
    fn apply_isqp_event(&self, work: &mut WorkingSet, event: IsqpEvent) -> Result<bool, UpdateError> {
        match event {
            IsqpEvent::AddNode(node) => {
                if work.topology.root().is_none() {
                    work.topology.set_root(node);
                } else {
                    work.topology.add_node(node);
                }
                Ok(false)
            }
            IsqpEvent::AddLink {
                upstream,
                downstream,
            } => work.topology.add_link(upstream, downstream).map(|()| false),
            IsqpEvent::AddLinkProperty {
                upstream,
                downstream,
                properties,
            } => work
                .topology
                .set_link_properties(upstream, downstream, properties)
                .map(|()| false),
            IsqpEvent::RemoveLink {
                upstream,
                downstream,
            } => Self::apply_remove_link(work, upstream, downstream).map(|()| false),
            IsqpEvent::RemoveNode(worker) => {
                Self::apply_remove_node(work, worker).map(|()| false)
            }
            IsqpEvent::AddQuery { plan, strategy } => self.apply_add_query(work, plan, strategy),
            IsqpEvent::RemoveQuery(query_id) => {
                Self::apply_stop_query(work, query_id).map(|()| false)
            }
        }
    }

    /// Per-plan change-log entries for a broken link. Scans all shared
    /// plans in parallel; pure reads.
    fn link_impacts(
        work: &WorkingSet,
        a: WorkerId,
        b: WorkerId,
    ) -> Vec<(SharedPlanId, Vec<PlanAnnotation>)> {
        let plans: Vec<&SharedQueryPlan> = work.global_query_plan.plans().collect();
        plans
            .par_iter()
            .filter_map(|plan| {
                let crossing = crossing_edges(plan, &work.execution_plan, &work.topology, a, b);
                if crossing.is_empty() {
                    return None;
                }
                Some((plan.id(), impact_entries(plan, crossing)))
            })
            .collect()
    }

    /// Per-plan change-log entries for a removed node.
    fn node_impacts(
        work: &WorkingSet,
        worker: WorkerId,
    ) -> Vec<(SharedPlanId, Vec<PlanAnnotation>)> {
        let plans: Vec<&SharedQueryPlan> = work.global_query_plan.plans().collect();
        plans
            .par_iter()
            .filter_map(|plan| {
                let hosted: Vec<OperatorId> = work
                    .execution_plan
                    .node(worker)
                    .map(|n| n.operators_of(plan.id()))
                    .unwrap_or_default();
                if hosted.is_empty() {
                    return None;
                }
                Some((plan.id(), node_impact_entries(plan, &hosted)))
            })
            .collect()
    }

    fn annotate_plan(
        work: &mut WorkingSet,
        plan_id: SharedPlanId,
        annotations: Vec<PlanAnnotation>,
    ) {
        let Some(plan) = work.global_query_plan.plan_mut(plan_id) else {
            return;
        };
        for annotation in annotations {
            for (op, state) in annotation.state_changes {
                if let Some(node) = plan.dag_mut().get_mut(op) {
                    node.state = state;
                }
            }
            plan.append_change_log(annotation.entry);
        }
    }
}

/// One change-log entry plus the operator-state annotations that go with it.
struct PlanAnnotation {
    entry: ChangeLogEntry,
    state_changes: Vec<(OperatorId, OperatorState)>,
}

/// Placed DAG edges of `plan` whose data path traverses the link (a, b).
fn crossing_edges(
    plan: &SharedQueryPlan,
    execution_plan: &GlobalExecutionPlan,
    topology: &Topology,
    a: WorkerId,
    b: WorkerId,
) -> Vec<(OperatorId, OperatorId)> {
    let mut crossing = Vec::new();
    for node in plan.dag().iter() {
        if node.state != OperatorState::Placed {
            continue;
        }
        let Some(from) = execution_plan.worker_of(plan.id(), node.id) else {
            continue;
        };
        for down in node.downstream() {
            let Some(down_node) = plan.dag().get(*down) else {
                continue;
            };
            if down_node.state != OperatorState::Placed {
                continue;
            }
            let Some(to) = execution_plan.worker_of(plan.id(), *down) else {
                continue;
            };
            if from == to {
                continue;
            }
            let Some(path) = topology.find_path_between(from, to) else {
                continue;
            };
            let uses_link = path
                .windows(2)
                .any(|w| (w[0] == a && w[1] == b) || (w[0] == b && w[1] == a));
            if uses_link {
                crossing.push((node.id, *down));
            }
        }
    }
    crossing
}

/// Turn crossing edges into change-log annotations. Edges ending in a union
/// operator get the replacement treatment: the union becomes `ToBeReplaced`
/// and the projection owning its downstream interface joins the entry.
fn impact_entries(
    plan: &SharedQueryPlan,
    crossing: Vec<(OperatorId, OperatorId)>,
) -> Vec<PlanAnnotation> {
    let mut annotations = Vec::new();
    let mut generic_upstream = BTreeSet::new();
    let mut generic_downstream = BTreeSet::new();
    let mut unions = BTreeSet::new();

    for (up, down) in crossing {
        let is_union = plan
            .dag()
            .get(down)
            .is_some_and(|n| matches!(n.kind, OperatorKind::Union));
        if is_union {
            unions.insert(down);
        } else {
            generic_upstream.insert(up);
            generic_downstream.insert(down);
        }
    }

    for union in unions {
        annotations.push(union_annotation(plan, union));
    }
    if !generic_upstream.is_empty() {
        annotations.push(PlanAnnotation {
            entry: ChangeLogEntry::new(generic_upstream, generic_downstream),
            state_changes: Vec::new(),
        });
    }
    annotations
}

/// Change-log annotations for operators stranded on a removed node.
fn node_impact_entries(plan: &SharedQueryPlan, hosted: &[OperatorId]) -> Vec<PlanAnnotation> {
    let mut annotations = Vec::new();
    let mut generic_upstream = BTreeSet::new();
    let mut generic_downstream = BTreeSet::new();

    for op in hosted {
        let Some(node) = plan.dag().get(*op) else {
            continue;
        };
        if matches!(node.kind, OperatorKind::Union) {
            annotations.push(union_annotation(plan, *op));
            continue;
        }
        // Boundary: the closest placed survivors on either side.
        let off_node = |candidate: &crate::operator::OperatorNode| {
            candidate.state == OperatorState::Placed && !hosted.contains(&candidate.id)
        };
        generic_upstream.extend(plan.dag().nearest_upstream_where(*op, off_node));
        generic_downstream.extend(plan.dag().nearest_downstream_where(*op, |n| {
            n.state == OperatorState::Placed && !hosted.contains(&n.id)
        }));
    }

    if !generic_upstream.is_empty() || !generic_downstream.is_empty() {
        annotations.push(PlanAnnotation {
            entry: ChangeLogEntry::new(generic_upstream, generic_downstream),
            state_changes: Vec::new(),
        });
    }
    annotations
}

/// The union replacement rule: upstream = the placed operators feeding the
/// union, downstream = the union plus the projection that assumes its
/// interface; the union itself transitions to `ToBeReplaced`.
fn union_annotation(plan: &SharedQueryPlan, union: OperatorId) -> PlanAnnotation {
    let upstream: BTreeSet<OperatorId> = plan
        .dag()
        .nearest_upstream_where(union, |n| n.state == OperatorState::Placed)
        .into_iter()
        .collect();
    let mut downstream = BTreeSet::from([union]);
    if let Some(node) = plan.dag().get(union) {
        for down in node.downstream() {
            if plan
                .dag()
                .get(*down)
                .is_some_and(|n| matches!(n.kind, OperatorKind::Projection { .. }))
            {
                downstream.insert(*down);
            }
        }
    }
    PlanAnnotation {
        entry: ChangeLogEntry::new(upstream, downstream),
        state_changes: vec![(union, OperatorState::ToBeReplaced)],
    }
}
