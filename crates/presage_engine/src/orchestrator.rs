//! Migration plan state machine and its driver.
//!
//! A plan advances `Created → Replicating → Syncing → CuttingOver →
//! Completed`; `Aborted` is reachable from every non-terminal phase. The
//! abort signal is observable at every poll point *except* inside the
//! cutover critical section, which either commits or times out but is never
//! left half-applied: the first successful routing repoint is the commit
//! point, before it every abort path leaves traffic on the source.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{AbortReason, EngineError};
use crate::estimator::MigrationAdvisory;
use crate::events::{EngineEvent, EngineMetrics, EventBus};
use crate::fleet::{FleetStore, ServerState};
use crate::routing::RoutingTable;
use crate::transfer::{DataTransfer, TransferStatus};
use crate::{PlanId, ServerId, ServiceId};

/// Retry pause inside the final-delta drain of the cutover section.
const FINAL_DELTA_RETRY: Duration = Duration::from_millis(5);

/// Phase of a migration plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Created,
    Replicating,
    Syncing,
    CuttingOver,
    Completed,
    Aborted,
}

impl MigrationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Completed | MigrationPhase::Aborted)
    }
}

/// A planned live migration, bound 1:1 to one source server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub plan_id: PlanId,
    pub source: ServerId,
    pub target: ServerId,
    /// Services hosted on the source at planning time.
    pub services: Vec<ServiceId>,
    pub score_at_trigger: f64,
    pub predicted_failure_eta_ms: Option<u64>,
    pub created_at_ms: u64,
}

/// Shared, externally observable state of an in-flight plan.
pub struct PlanHandle {
    pub plan: MigrationPlan,
    phase: Mutex<MigrationPhase>,
    abort_tx: watch::Sender<Option<AbortReason>>,
    cutover_committed: AtomicBool,
}

impl PlanHandle {
    fn new(plan: MigrationPlan) -> Self {
        let (abort_tx, _) = watch::channel(None);
        Self {
            plan,
            phase: Mutex::new(MigrationPhase::Created),
            abort_tx,
            cutover_committed: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, to: MigrationPhase) -> MigrationPhase {
        let mut phase = self.phase.lock().unwrap();
        std::mem::replace(&mut *phase, to)
    }

    /// Request an abort; the first reason wins. Returns whether this call
    /// installed the reason.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.abort_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.abort_tx.borrow()
    }

    fn subscribe_abort(&self) -> watch::Receiver<Option<AbortReason>> {
        self.abort_tx.subscribe()
    }

    /// True once the cutover has passed its commit point; from here the
    /// source's death is a preempted failure, not a plan failure.
    pub fn cutover_committed(&self) -> bool {
        self.cutover_committed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cutover_committed(&self) {
        self.cutover_committed.store(true, Ordering::Release);
    }
}

/// Registry of in-flight plans; enforces one active plan per source server.
#[derive(Default)]
pub struct PlanRegistry {
    next_plan_id: AtomicU64,
    active: Mutex<BTreeMap<ServerId, Arc<PlanHandle>>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a plan for the advisory's source.
    pub fn begin(
        &self,
        advisory: &MigrationAdvisory,
        target: ServerId,
        services: Vec<ServiceId>,
    ) -> Result<Arc<PlanHandle>, EngineError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(&advisory.source) {
            return Err(EngineError::PlanAlreadyActive(advisory.source));
        }
        let plan_id = self.next_plan_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(PlanHandle::new(MigrationPlan {
            plan_id,
            source: advisory.source,
            target,
            services,
            score_at_trigger: advisory.score_at_trigger,
            predicted_failure_eta_ms: advisory.predicted_failure_eta_ms,
            created_at_ms: crate::unix_time_ms(),
        }));
        active.insert(advisory.source, handle.clone());
        Ok(handle)
    }

    pub fn active_for_source(&self, source: ServerId) -> Option<Arc<PlanHandle>> {
        self.active.lock().unwrap().get(&source).cloned()
    }

    pub fn active_for_target(&self, target: ServerId) -> Vec<Arc<PlanHandle>> {
        self.active
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.plan.target == target)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn finish(&self, source: ServerId) {
        self.active.lock().unwrap().remove(&source);
    }
}

/// Fallback path invoked when live migration cannot save a service.
pub trait EscalationHook: Send + Sync + 'static {
    fn escalate_cold_migration(&self, service_id: ServiceId, source: ServerId, reason: AbortReason);
}

/// Default hook: the reactive path lives outside this engine, so just log.
pub struct LogEscalation;

impl EscalationHook for LogEscalation {
    fn escalate_cold_migration(&self, service_id: ServiceId, source: ServerId, reason: AbortReason) {
        tracing::warn!(service_id, source, %reason, "escalating to cold migration");
    }
}

enum CutoverResult {
    Committed { downtime_ms: u64 },
    TimedOut,
    Failed,
}

/// Executes migration plans against the transfer and routing collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    cfg: Arc<EngineConfig>,
    fleet: Arc<FleetStore>,
    transfer: Arc<dyn DataTransfer>,
    routing: Arc<dyn RoutingTable>,
    escalation: Arc<dyn EscalationHook>,
    events: Arc<EventBus>,
    metrics: Arc<EngineMetrics>,
    registry: Arc<PlanRegistry>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<EngineConfig>,
        fleet: Arc<FleetStore>,
        transfer: Arc<dyn DataTransfer>,
        routing: Arc<dyn RoutingTable>,
        escalation: Arc<dyn EscalationHook>,
        events: Arc<EventBus>,
        metrics: Arc<EngineMetrics>,
        registry: Arc<PlanRegistry>,
    ) -> Self {
        Self {
            cfg,
            fleet,
            transfer,
            routing,
            escalation,
            events,
            metrics,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<PlanRegistry> {
        &self.registry
    }

    /// Drive the plan on its own task; other plans are never blocked.
    pub fn spawn_plan(&self, handle: Arc<PlanHandle>) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_plan(handle).await;
        });
    }

    /// Drive one plan from `Created` to a terminal phase.
    pub async fn run_plan(&self, handle: Arc<PlanHandle>) {
        let plan = handle.plan.clone();
        let mut abort_rx = handle.subscribe_abort();

        self.fleet.set_state(plan.source, ServerState::Migrating);
        self.transition(&handle, MigrationPhase::Replicating);

        let transfer_handle = match self.transfer.start_bulk_copy(plan.source, plan.target).await {
            Ok(h) => h,
            Err(err) => {
                tracing::warn!(plan_id = plan.plan_id, error = ?err, "bulk copy failed to start");
                return self.finish_aborted(&handle, AbortReason::TransferFailed).await;
            }
        };

        loop {
            if let Some(reason) = handle.abort_reason() {
                return self.finish_aborted(&handle, reason).await;
            }
            match self.transfer.poll_transfer(transfer_handle).await {
                Ok(TransferStatus::Done) => break,
                Ok(TransferStatus::Pending) => {
                    if let Some(reason) =
                        sleep_observing_abort(&mut abort_rx, self.cfg.replicate_poll_interval).await
                    {
                        return self.finish_aborted(&handle, reason).await;
                    }
                }
                Ok(TransferStatus::Failed) => {
                    tracing::warn!(plan_id = plan.plan_id, "bulk copy reported failure");
                    return self.finish_aborted(&handle, AbortReason::TransferFailed).await;
                }
                Err(err) => {
                    tracing::warn!(plan_id = plan.plan_id, error = ?err, "bulk copy poll failed");
                    return self.finish_aborted(&handle, AbortReason::TransferFailed).await;
                }
            }
        }

        self.transition(&handle, MigrationPhase::Syncing);
        let mut iterations = 0u32;
        loop {
            if let Some(reason) = handle.abort_reason() {
                return self.finish_aborted(&handle, reason).await;
            }
            if iterations >= self.cfg.max_sync_iterations {
                tracing::warn!(
                    plan_id = plan.plan_id,
                    iterations,
                    "delta backlog failed to converge"
                );
                return self.finish_aborted(&handle, AbortReason::SyncDivergence).await;
            }
            iterations += 1;
            let outcome = match self.transfer.apply_delta(plan.source, plan.target).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(plan_id = plan.plan_id, error = ?err, "delta apply failed");
                    return self.finish_aborted(&handle, AbortReason::TransferFailed).await;
                }
            };
            tracing::debug!(
                plan_id = plan.plan_id,
                iteration = iterations,
                applied = outcome.applied,
                lag = outcome.lag,
                "delta round applied"
            );
            if outcome.lag <= self.cfg.sync_lag_bound {
                break;
            }
            if let Some(reason) =
                sleep_observing_abort(&mut abort_rx, self.cfg.replicate_poll_interval).await
            {
                return self.finish_aborted(&handle, reason).await;
            }
        }

        // Last abort observation point before the uninterruptible section.
        if let Some(reason) = handle.abort_reason() {
            return self.finish_aborted(&handle, reason).await;
        }
        self.transition(&handle, MigrationPhase::CuttingOver);

        match self.cutover(&handle).await {
            CutoverResult::Committed { downtime_ms } => {
                self.transition(&handle, MigrationPhase::Completed);
                self.fleet.commit_move(&plan.services, plan.source, plan.target);
                self.metrics.record_completed(downtime_ms);
                self.events.emit(EngineEvent::MigrationCompleted {
                    plan_id: plan.plan_id,
                    downtime_ms,
                });
                tracing::info!(
                    plan_id = plan.plan_id,
                    source = plan.source,
                    target = plan.target,
                    downtime_ms,
                    "live migration completed"
                );
                self.registry.finish(plan.source);
            }
            CutoverResult::TimedOut => {
                self.finish_aborted(&handle, AbortReason::CutoverTimeout).await;
            }
            CutoverResult::Failed => {
                self.finish_aborted(&handle, AbortReason::TransferFailed).await;
            }
        }
    }

    /// The cutover critical section. Not abortable from outside: it either
    /// commits, fails pre-commit (routing untouched), or exceeds the budget.
    async fn cutover(&self, handle: &PlanHandle) -> CutoverResult {
        let plan = &handle.plan;
        let budget = self.cfg.cutover_budget;
        let started = Instant::now();

        if let Err(err) = self.transfer.pause_writes(plan.source).await {
            tracing::warn!(plan_id = plan.plan_id, error = ?err, "failed to pause source writes");
            return CutoverResult::Failed;
        }

        let final_delta = tokio::time::timeout(budget, async {
            loop {
                match self.transfer.apply_delta(plan.source, plan.target).await {
                    Ok(outcome) if outcome.lag == 0 => return Ok(()),
                    Ok(_) => tokio::time::sleep(FINAL_DELTA_RETRY).await,
                    Err(err) => return Err(err),
                }
            }
        })
        .await;
        match final_delta {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(plan_id = plan.plan_id, error = ?err, "final delta failed");
                let _ = self.transfer.resume_writes(plan.source).await;
                return CutoverResult::Failed;
            }
            Err(_) => {
                let _ = self.transfer.resume_writes(plan.source).await;
                return CutoverResult::TimedOut;
            }
        }
        if started.elapsed() >= budget {
            let _ = self.transfer.resume_writes(plan.source).await;
            return CutoverResult::TimedOut;
        }

        // Commit point: the first successful repoint makes the cutover
        // irreversible. A later per-service repoint failure cannot roll the
        // committed ones back, so those services go to the cold path.
        let mut committed = false;
        for svc in &plan.services {
            match self.routing.repoint(*svc, plan.source, plan.target) {
                Ok(()) => {
                    if !committed {
                        committed = true;
                        handle.mark_cutover_committed();
                    }
                }
                Err(err) => {
                    tracing::error!(
                        plan_id = plan.plan_id,
                        service_id = svc,
                        error = ?err,
                        "repoint failed during cutover"
                    );
                    if committed {
                        self.escalate(*svc, plan.source, AbortReason::TransferFailed);
                    } else {
                        let _ = self.transfer.resume_writes(plan.source).await;
                        return CutoverResult::Failed;
                    }
                }
            }
        }
        if !committed {
            // A plan with no services has nothing to repoint; trivially done.
            handle.mark_cutover_committed();
        }
        let _ = self.transfer.resume_writes(plan.source).await;

        let downtime_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        CutoverResult::Committed { downtime_ms }
    }

    async fn finish_aborted(&self, handle: &Arc<PlanHandle>, reason: AbortReason) {
        let plan = &handle.plan;
        // Writes may still be paused from a failed cutover attempt.
        let _ = self.transfer.resume_writes(plan.source).await;
        self.transition(handle, MigrationPhase::Aborted);
        self.fleet.release(plan.target, plan.services.len() as u32);

        let source_member = self.fleet.contains(plan.source);
        let source_alive = self.fleet.is_alive(plan.source);
        if source_alive {
            // Still suspect; the estimator re-promotes it when it recovers.
            self.fleet.set_state(plan.source, ServerState::Degraded);
        }
        // A source that left the fleet was decommissioned on purpose; its
        // services are gone with it, so there is nothing to escalate.
        if source_member && reason.escalates(source_alive) {
            for svc in &plan.services {
                self.escalate(*svc, plan.source, reason);
            }
        }

        self.metrics.record_aborted();
        self.events.emit(EngineEvent::MigrationAborted {
            plan_id: plan.plan_id,
            reason,
        });
        tracing::warn!(
            plan_id = plan.plan_id,
            source = plan.source,
            target = plan.target,
            %reason,
            "migration aborted"
        );
        self.registry.finish(plan.source);
    }

    pub(crate) fn escalate(&self, service_id: ServiceId, source: ServerId, reason: AbortReason) {
        self.metrics.record_cold_escalation();
        self.events.emit(EngineEvent::ColdMigrationEscalated {
            service_id,
            source,
            reason,
        });
        self.escalation.escalate_cold_migration(service_id, source, reason);
    }

    fn transition(&self, handle: &PlanHandle, to: MigrationPhase) {
        let from = handle.set_phase(to);
        tracing::info!(
            plan_id = handle.plan.plan_id,
            from = ?from,
            to = ?to,
            "migration state changed"
        );
        self.events.emit(EngineEvent::MigrationStateChanged {
            plan_id: handle.plan.plan_id,
            from,
            to,
        });
    }
}

/// Wait out one poll interval, waking early if an abort lands.
async fn sleep_observing_abort(
    rx: &mut watch::Receiver<Option<AbortReason>>,
    interval: Duration,
) -> Option<AbortReason> {
    if let Some(reason) = *rx.borrow() {
        return Some(reason);
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = rx.changed() => {}
    }
    *rx.borrow()
}
