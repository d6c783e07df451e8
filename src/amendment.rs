//! The placement-amendment handler: a worker pool applying placement
//! strategies to dirty shared plans.
//!
//! The update phase emits one [`PlacementAmendmentInstance`] per shared
//! plan with a pending change-log; instances enter an unbounded
//! multi-producer multi-consumer queue consumed by
//! `placement_amendment_thread_count` worker threads.
//!
//! Each amender runs under one of two concurrency disciplines:
//!
//! - **Pessimistic (2PL)** -- the amender acquires every resource it will
//!   touch in the canonical lock order and holds the locks to commit. The
//!   total order precludes deadlock. The pass still computes on clones and
//!   swaps on success, so a placement failure leaves nothing half-applied.
//! - **Optimistic (OCC)** -- the amender snapshots resource versions,
//!   computes on clones without holding write locks, and commits under a
//!   short validate-and-swap critical section. A conflicting commit
//!   triggers a retry, up to the instance's retry budget; after exhaustion
//!   the shared plan is left `Optimizing` with its change-log intact so a
//!   later batch can try again.
//!
//! `shut_down` closes the queue, drains in-flight instances, and joins the
//! workers; enqueues submitted after shutdown are rejected.

use crate::catalog::QueryState;
use crate::config::{CoordinatorConfig, PlacementAmendmentMode};
use crate::error::StorageError;
use crate::placement::{PlacementContext, PlacementStrategy, amend_placement};
use crate::query_plan::QueryId;
use crate::shared_plan::{SharedPlanId, SharedQueryPlanStatus};
use crate::storage::{
    CoordinatorState, OptimisticStorageHandler, ResourceHolder, ResourceId,
    TwoPhaseLockingStorageHandler,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// One unit of amendment work: a dirty shared plan plus how to place it.
#[derive(Clone, Copy, Debug)]
pub struct PlacementAmendmentInstance {
    pub plan_id: SharedPlanId,
    pub strategy: PlacementStrategy,
    pub mode: PlacementAmendmentMode,
    /// Optimistic validation retries before giving up.
    pub retry_count: u32,
}

impl PlacementAmendmentInstance {
    #[must_use]
    pub fn new(
        plan_id: SharedPlanId,
        strategy: PlacementStrategy,
        mode: PlacementAmendmentMode,
        retry_count: u32,
    ) -> Self {
        Self {
            plan_id,
            strategy,
            mode,
            retry_count,
        }
    }
}

#[derive(Default)]
struct Pending {
    count: Mutex<u64>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Worker pool consuming placement-amendment instances.
pub struct PlacementAmendmentHandler {
    state: CoordinatorState,
    config: CoordinatorConfig,
    thread_count: usize,
    sender: Option<Sender<PlacementAmendmentInstance>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl PlacementAmendmentHandler {
    #[must_use]
    pub fn new(thread_count: usize, state: CoordinatorState, config: CoordinatorConfig) -> Self {
        Self {
            state,
            config,
            thread_count: thread_count.max(1),
            sender: None,
            workers: Vec::new(),
            pending: Arc::new(Pending::default()),
        }
    }

    /// Spawn the worker threads. Calling `start` twice is a no-op.
    pub fn start(&mut self) {
        if self.sender.is_some() {
            return;
        }
        let (sender, receiver) = unbounded::<PlacementAmendmentInstance>();
        self.sender = Some(sender);
        for worker_index in 0..self.thread_count {
            let receiver: Receiver<PlacementAmendmentInstance> = receiver.clone();
            let state = self.state.clone();
            let config = self.config.clone();
            let pending = Arc::clone(&self.pending);
            self.workers.push(std::thread::spawn(move || {
                debug!(worker_index, "amendment worker up");
                while let Ok(instance) = receiver.recv() {
                    amend(&state, &config, instance);
                    pending.finish();
                }
                debug!(worker_index, "amendment worker down");
            }));
        }
        info!(threads = self.thread_count, "amendment handler started");
    }

    /// Submit an instance to the pool.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::ShutDown`] when the handler was never
    /// started or has been shut down.
    pub fn enqueue(&self, instance: PlacementAmendmentInstance) -> Result<(), StorageError> {
        let sender = self.sender.as_ref().ok_or(StorageError::ShutDown)?;
        self.pending.add();
        sender.send(instance).map_err(|_| {
            self.pending.finish();
            StorageError::ShutDown
        })
    }

    /// Block until every enqueued instance has been processed.
    pub fn await_idle(&self) {
        self.pending.wait_idle();
    }

    /// Drain the queue, join the workers, and reject further enqueues.
    pub fn shut_down(&mut self) {
        // Dropping the sender disconnects the channel; workers drain what
        // is already queued and then exit.
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("amendment handler shut down");
    }
}

impl Drop for PlacementAmendmentHandler {
    fn drop(&mut self) {
        self.shut_down();
    }
}

fn amend(state: &CoordinatorState, config: &CoordinatorConfig, instance: PlacementAmendmentInstance) {
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();
    let outcome = match instance.mode {
        PlacementAmendmentMode::Pessimistic => amend_pessimistic(state, config, instance),
        PlacementAmendmentMode::Optimistic => amend_optimistic(state, config, instance),
    };
    #[cfg(feature = "metrics")]
    {
        state
            .metrics()
            .record_duration("amendment_runtime", started.elapsed());
        match outcome {
            Ok(AmendmentOutcome::Committed) => {
                state.metrics().increment("amendments_committed", 1);
            }
            Ok(AmendmentOutcome::Parked) | Err(_) => {
                state.metrics().increment("amendments_failed", 1);
            }
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// What became of one amendment instance.
enum AmendmentOutcome {
    /// The placement pass committed; the plan is deployed.
    Committed,
    /// The plan was left `Optimizing` with its change-log intact.
    Parked,
}

/// 2PL amender: lock everything in canonical order, compute on clones,
/// swap, release.
fn amend_pessimistic(
    state: &CoordinatorState,
    config: &CoordinatorConfig,
    instance: PlacementAmendmentInstance,
) -> Result<AmendmentOutcome, StorageError> {
    let storage =
        TwoPhaseLockingStorageHandler::new(state.clone(), config.lock_timeout, config.lock_retry_count);
    let mut holder = match storage.acquire(&ResourceId::ALL) {
        Ok(holder) => holder,
        Err(e) => {
            warn!(plan = %instance.plan_id, error = %e, "amendment could not acquire storage");
            return Err(e);
        }
    };

    let Some(mut shared) = holder.global_query_plan().plan(instance.plan_id).cloned() else {
        return Ok(AmendmentOutcome::Committed);
    };
    if !shared.needs_deployment() {
        return Ok(AmendmentOutcome::Committed);
    }

    let mut topology = holder.topology().clone();
    let mut execution_plan = holder.global_execution_plan().clone();
    let source_catalog = holder.source_catalog().clone();
    let mut ctx = PlacementContext {
        topology: &mut topology,
        execution_plan: &mut execution_plan,
        source_catalog: &source_catalog,
        incremental: config.enable_incremental_placement,
    };

    match amend_placement(&mut shared, &mut ctx) {
        Ok(report) => {
            debug!(plan = %instance.plan_id, placed = report.placed, "amendment committed (2pl)");
            if shared.status() != SharedQueryPlanStatus::Stopped {
                shared.set_status(SharedQueryPlanStatus::Deployed);
            }
            let hosted = shared.hosted_query_ids();
            *holder.topology_mut() = topology;
            *holder.global_execution_plan_mut() = execution_plan;
            holder.global_query_plan_mut().install_plan(shared);
            finish_query_states(&mut holder, &hosted);
            Ok(AmendmentOutcome::Committed)
        }
        Err(e) => {
            warn!(plan = %instance.plan_id, error = %e, "placement failed, plan stays optimizing");
            if let Some(live) = holder.global_query_plan_mut().plan_mut(instance.plan_id) {
                live.set_status(SharedQueryPlanStatus::Optimizing);
            }
            Ok(AmendmentOutcome::Parked)
        }
    }
}

/// OCC amender: snapshot versions, compute on clones, validate-and-swap,
/// retry on conflict.
fn amend_optimistic(
    state: &CoordinatorState,
    config: &CoordinatorConfig,
    instance: PlacementAmendmentInstance,
) -> Result<AmendmentOutcome, StorageError> {
    const WATCHED: [ResourceId; 4] = [
        ResourceId::Topology,
        ResourceId::GlobalQueryPlan,
        ResourceId::GlobalExecutionPlan,
        ResourceId::QueryCatalog,
    ];
    let occ = OptimisticStorageHandler::new(state.clone());

    for attempt in 0..=instance.retry_count {
        // Versions first, data clones second: a commit racing the clone is
        // caught by validation.
        let snapshot = occ.snapshot(&WATCHED);
        let Some(mut shared) = state
            .read_global_query_plan()
            .plan(instance.plan_id)
            .cloned()
        else {
            return Ok(AmendmentOutcome::Committed);
        };
        if !shared.needs_deployment() {
            return Ok(AmendmentOutcome::Committed);
        }
        let mut topology = state.read_topology().clone();
        let mut execution_plan = state.read_global_execution_plan().clone();
        let source_catalog = state.read_source_catalog().clone();

        let mut ctx = PlacementContext {
            topology: &mut topology,
            execution_plan: &mut execution_plan,
            source_catalog: &source_catalog,
            incremental: config.enable_incremental_placement,
        };
        let placement = amend_placement(&mut shared, &mut ctx);

        match placement {
            Err(e) => {
                warn!(plan = %instance.plan_id, error = %e, "placement failed, plan stays optimizing");
                park_optimizing(state, config, instance.plan_id);
                return Ok(AmendmentOutcome::Parked);
            }
            Ok(report) => {
                let commit = occ.validate_and_commit(&snapshot, |holder: &mut ResourceHolder| {
                    if shared.status() != SharedQueryPlanStatus::Stopped {
                        shared.set_status(SharedQueryPlanStatus::Deployed);
                    }
                    let hosted = shared.hosted_query_ids();
                    *holder.topology_mut() = topology;
                    *holder.global_execution_plan_mut() = execution_plan;
                    holder.global_query_plan_mut().install_plan(shared);
                    finish_query_states(holder, &hosted);
                });
                match commit {
                    Ok(()) => {
                        debug!(
                            plan = %instance.plan_id,
                            attempt,
                            placed = report.placed,
                            "amendment committed (occ)"
                        );
                        return Ok(AmendmentOutcome::Committed);
                    }
                    Err(StorageError::ValidationConflict(resource)) => {
                        #[cfg(feature = "metrics")]
                        state.metrics().increment("occ_conflicts", 1);
                        debug!(plan = %instance.plan_id, attempt, ?resource, "occ validation conflict");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    warn!(plan = %instance.plan_id, "occ retries exhausted, plan stays optimizing");
    park_optimizing(state, config, instance.plan_id);
    Ok(AmendmentOutcome::Parked)
}

/// Leave a plan `Optimizing` with its change-log intact after a failed
/// amendment.
fn park_optimizing(state: &CoordinatorState, config: &CoordinatorConfig, plan_id: SharedPlanId) {
    let storage =
        TwoPhaseLockingStorageHandler::new(state.clone(), config.lock_timeout, config.lock_retry_count);
    if let Ok(mut holder) = storage.acquire(&[ResourceId::GlobalQueryPlan]) {
        if let Some(plan) = holder.global_query_plan_mut().plan_mut(plan_id) {
            plan.set_status(SharedQueryPlanStatus::Optimizing);
        }
    }
}

/// Advance query-catalog states after a committed amendment: hosted queries
/// run, stopped queries whose plan no longer hosts them stop.
fn finish_query_states(holder: &mut ResourceHolder, hosted: &[QueryId]) {
    for query_id in hosted {
        let _ = holder
            .query_catalog_mut()
            .set_state(*query_id, QueryState::Running);
    }
    let marked: Vec<QueryId> = holder
        .query_catalog()
        .queries()
        .filter(|e| e.state == QueryState::MarkedForStop)
        .map(|e| e.query_id)
        .collect();
    for query_id in marked {
        if holder
            .global_query_plan()
            .shared_plan_for_query(query_id)
            .is_none()
        {
            let _ = holder
                .query_catalog_mut()
                .set_state(query_id, QueryState::Stopped);
        }
    }
}
