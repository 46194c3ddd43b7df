//! Failure watchdog: liveness changes as pure external input.
//!
//! The watchdog never mutates a plan directly; it signals aborts through the
//! plan handle and lets the orchestrator's driver observe them. This keeps
//! the liveness/migration dependency acyclic and makes the abort path
//! testable in isolation.

use std::sync::Arc;

use crate::error::AbortReason;
use crate::estimator::ReliabilityEstimator;
use crate::events::{EngineEvent, EngineMetrics, EventBus};
use crate::fleet::{FleetStore, ServerState};
use crate::orchestrator::{MigrationPhase, Orchestrator, PlanRegistry};
use crate::ServerId;

pub struct Watchdog {
    fleet: Arc<FleetStore>,
    estimator: Arc<ReliabilityEstimator>,
    registry: Arc<PlanRegistry>,
    orchestrator: Orchestrator,
    events: Arc<EventBus>,
    metrics: Arc<EngineMetrics>,
}

impl Watchdog {
    pub fn new(
        fleet: Arc<FleetStore>,
        estimator: Arc<ReliabilityEstimator>,
        registry: Arc<PlanRegistry>,
        orchestrator: Orchestrator,
        events: Arc<EventBus>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            fleet,
            estimator,
            registry,
            orchestrator,
            events,
            metrics,
        }
    }

    pub fn on_liveness_change(&self, server_id: ServerId, alive: bool) {
        if alive {
            self.handle_revival(server_id);
        } else {
            self.handle_failure(server_id);
        }
    }

    fn handle_failure(&self, server_id: ServerId) {
        let Some(prev_state) = self.fleet.set_alive(server_id, false) else {
            tracing::debug!(server_id, "liveness change for unknown server");
            return;
        };
        self.estimator.record_failure(server_id, crate::unix_time_ms());

        let mut acted = false;

        if let Some(handle) = self.registry.active_for_source(server_id) {
            acted = true;
            if handle.cutover_committed() || handle.phase() == MigrationPhase::Completed {
                // Cutover already holds on the target; the source's death is
                // the failure we migrated to avoid.
                self.record_preempted(server_id);
            } else {
                tracing::warn!(
                    server_id,
                    plan_id = handle.plan.plan_id,
                    phase = ?handle.phase(),
                    "source died before cutover committed"
                );
                handle.abort(AbortReason::SourceFailedMidMigration);
            }
        }

        for handle in self.registry.active_for_target(server_id) {
            acted = true;
            tracing::warn!(
                server_id,
                plan_id = handle.plan.plan_id,
                "migration target died"
            );
            handle.abort(AbortReason::TransferFailed);
        }

        if !acted {
            if prev_state == ServerState::Drained {
                // Already migrated away; this failure costs nothing.
                self.record_preempted(server_id);
            } else {
                let services = self.fleet.snapshot().services_on(server_id);
                if services.is_empty() {
                    tracing::info!(server_id, "idle server failed");
                } else {
                    // No plan was in flight for these services: this is the
                    // reactive path the engine exists to avoid.
                    for svc in services {
                        self.orchestrator.escalate(
                            svc,
                            server_id,
                            AbortReason::SourceFailedMidMigration,
                        );
                    }
                }
            }
        }

        self.fleet.set_state(server_id, ServerState::Failed);
    }

    fn handle_revival(&self, server_id: ServerId) {
        let Some(prev_state) = self.fleet.set_alive(server_id, true) else {
            tracing::debug!(server_id, "revival of unknown server");
            return;
        };
        if matches!(prev_state, ServerState::Failed | ServerState::Drained) {
            self.fleet.set_state(server_id, ServerState::Healthy);
            // Pre-failure samples say nothing about the rebooted server.
            self.estimator.reset_window(server_id);
            tracing::info!(server_id, "server rejoined after failure");
        }
    }

    fn record_preempted(&self, server_id: ServerId) {
        self.metrics.record_preempted();
        self.events
            .emit(EngineEvent::FailurePreempted { server_id });
        tracing::info!(
            server_id,
            "server failure preempted by completed live migration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::estimator::MigrationAdvisory;
    use crate::orchestrator::LogEscalation;
    use crate::routing::InMemoryRouting;
    use crate::transfer::{SimTransfer, SimTransferConfig};

    fn watchdog() -> (Watchdog, Arc<FleetStore>, Arc<PlanRegistry>, Arc<EngineMetrics>) {
        let cfg = Arc::new(EngineConfig::default());
        let fleet = Arc::new(FleetStore::new());
        let estimator = Arc::new(ReliabilityEstimator::new(cfg.clone()));
        let registry = Arc::new(PlanRegistry::new());
        let events = Arc::new(EventBus::default());
        let metrics = Arc::new(EngineMetrics::default());
        let orchestrator = Orchestrator::new(
            cfg,
            fleet.clone(),
            Arc::new(SimTransfer::new(SimTransferConfig::default())),
            Arc::new(InMemoryRouting::new()),
            Arc::new(LogEscalation),
            events.clone(),
            metrics.clone(),
            registry.clone(),
        );
        let watchdog = Watchdog::new(
            fleet.clone(),
            estimator,
            registry.clone(),
            orchestrator,
            events,
            metrics.clone(),
        );
        (watchdog, fleet, registry, metrics)
    }

    fn advisory(source: crate::ServerId) -> MigrationAdvisory {
        MigrationAdvisory {
            source,
            score_at_trigger: 0.9,
            predicted_failure_eta_ms: None,
            at_ms: 0,
        }
    }

    #[test]
    fn drained_server_death_is_a_preempted_failure() {
        let (watchdog, fleet, _registry, metrics) = watchdog();
        fleet.join_server(1, 4);
        fleet.set_state(1, ServerState::Drained);

        watchdog.on_liveness_change(1, false);

        assert_eq!(metrics.snapshot().failures_preempted, 1);
        assert_eq!(metrics.snapshot().cold_escalations, 0);
        assert_eq!(fleet.state_of(1), Some(ServerState::Failed));
    }

    #[test]
    fn source_death_mid_plan_signals_abort() {
        let (watchdog, fleet, registry, metrics) = watchdog();
        fleet.join_server(1, 4);
        fleet.join_server(2, 4);
        let handle = registry.begin(&advisory(1), 2, vec![10]).unwrap();

        watchdog.on_liveness_change(1, false);

        assert_eq!(
            handle.abort_reason(),
            Some(AbortReason::SourceFailedMidMigration)
        );
        assert_eq!(metrics.snapshot().failures_preempted, 0);
    }

    #[test]
    fn source_death_after_cutover_commit_is_preempted_not_aborted() {
        let (watchdog, fleet, registry, metrics) = watchdog();
        fleet.join_server(1, 4);
        fleet.join_server(2, 4);
        let handle = registry.begin(&advisory(1), 2, vec![10]).unwrap();
        // A plan whose cutover has committed but is still finishing up.
        handle.mark_cutover_committed();

        watchdog.on_liveness_change(1, false);

        assert_eq!(metrics.snapshot().failures_preempted, 1);
        assert_eq!(handle.abort_reason(), None);
    }

    #[test]
    fn dead_server_with_services_and_no_plan_escalates() {
        let (watchdog, fleet, _registry, metrics) = watchdog();
        fleet.join_server(1, 4);
        assert!(fleet.assign_service(10, 1));
        assert!(fleet.assign_service(11, 1));

        watchdog.on_liveness_change(1, false);

        assert_eq!(metrics.snapshot().cold_escalations, 2);
        assert_eq!(metrics.snapshot().failures_preempted, 0);
    }

    #[test]
    fn target_death_aborts_the_plan() {
        let (watchdog, fleet, registry, _metrics) = watchdog();
        fleet.join_server(1, 4);
        fleet.join_server(2, 4);
        let handle = registry.begin(&advisory(1), 2, vec![10]).unwrap();

        watchdog.on_liveness_change(2, false);
        assert_eq!(handle.abort_reason(), Some(AbortReason::TransferFailed));
    }

    #[test]
    fn revival_resets_failed_server_to_healthy() {
        let (watchdog, fleet, _registry, _metrics) = watchdog();
        fleet.join_server(1, 4);
        watchdog.on_liveness_change(1, false);
        assert_eq!(fleet.state_of(1), Some(ServerState::Failed));

        watchdog.on_liveness_change(1, true);
        assert_eq!(fleet.state_of(1), Some(ServerState::Healthy));
        assert!(fleet.is_alive(1));
    }
}
