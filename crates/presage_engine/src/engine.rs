//! Engine facade: wires the estimator, planner, orchestrator, and watchdog
//! around one shared fleet table.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::error::{AbortReason, EngineError};
use crate::estimator::{MigrationAdvisory, ReliabilityEstimator, ReliabilityScore, ServerStats};
use crate::events::{EngineEvent, EngineMetrics, EventBus, MetricsSnapshot};
use crate::fleet::{FleetSnapshot, FleetStore, ServerState};
use crate::orchestrator::{EscalationHook, Orchestrator, PlanRegistry};
use crate::planner;
use crate::routing::RoutingTable;
use crate::transfer::DataTransfer;
use crate::watchdog::Watchdog;
use crate::{PlanId, ServerId, ServiceId};

/// The predictive live-migration engine.
///
/// Feed telemetry through [`Engine::submit_sample`] and liveness through
/// [`Engine::on_liveness_change`]; the engine raises advisories, plans and
/// executes migrations, and emits an event per observable transition.
pub struct Engine {
    cfg: Arc<EngineConfig>,
    fleet: Arc<FleetStore>,
    estimator: Arc<ReliabilityEstimator>,
    routing: Arc<dyn RoutingTable>,
    orchestrator: Orchestrator,
    watchdog: Watchdog,
    registry: Arc<PlanRegistry>,
    events: Arc<EventBus>,
    metrics: Arc<EngineMetrics>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        transfer: Arc<dyn DataTransfer>,
        routing: Arc<dyn RoutingTable>,
        escalation: Arc<dyn EscalationHook>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let fleet = Arc::new(FleetStore::new());
        let estimator = Arc::new(ReliabilityEstimator::new(cfg.clone()));
        let events = Arc::new(EventBus::default());
        let metrics = Arc::new(EngineMetrics::default());
        let registry = Arc::new(PlanRegistry::new());
        let orchestrator = Orchestrator::new(
            cfg.clone(),
            fleet.clone(),
            transfer,
            routing.clone(),
            escalation,
            events.clone(),
            metrics.clone(),
            registry.clone(),
        );
        let watchdog = Watchdog::new(
            fleet.clone(),
            estimator.clone(),
            registry.clone(),
            orchestrator.clone(),
            events.clone(),
            metrics.clone(),
        );
        Self {
            cfg,
            fleet,
            estimator,
            routing,
            orchestrator,
            watchdog,
            registry,
            events,
            metrics,
        }
    }

    /// Add a server to the monitored fleet.
    pub fn server_join(&self, server_id: ServerId, capacity: u32) {
        self.fleet.join_server(server_id, capacity);
        self.estimator.register(server_id, crate::unix_time_ms());
        tracing::info!(server_id, capacity, "server joined fleet");
    }

    /// Permanently remove a server; any in-flight plan for it is cancelled
    /// and its routing entries are withdrawn. Returns orphaned services.
    pub fn server_remove(&self, server_id: ServerId) -> Vec<ServiceId> {
        if let Some(handle) = self.registry.active_for_source(server_id) {
            handle.abort(AbortReason::OperatorCancelled);
        }
        let orphaned = self.fleet.remove_server(server_id);
        self.estimator.remove(server_id);
        for svc in &orphaned {
            self.routing.withdraw(*svc);
        }
        tracing::info!(server_id, orphaned = orphaned.len(), "server removed from fleet");
        orphaned
    }

    /// Place a service on a server and publish its routing authority.
    /// Returns false when the server is unknown or has no spare capacity.
    pub fn deploy_service(&self, service_id: ServiceId, server_id: ServerId) -> bool {
        if !self.fleet.assign_service(service_id, server_id) {
            return false;
        }
        self.routing.publish(service_id, server_id);
        true
    }

    /// Ingest one telemetry sample for a fleet member.
    pub fn submit_sample(
        &self,
        server_id: ServerId,
        timestamp_ms: u64,
        signals: &BTreeMap<String, f64>,
    ) -> Result<(), EngineError> {
        if !self.fleet.contains(server_id) {
            return Err(EngineError::UnknownServer(server_id));
        }
        let advisory = match self.estimator.record_sample(server_id, timestamp_ms, signals) {
            Ok(advisory) => advisory,
            Err(err) => {
                if matches!(err, EngineError::InvalidSample(_)) {
                    self.metrics.record_invalid_sample();
                    tracing::debug!(server_id, error = %err, "dropped invalid sample");
                }
                return Err(err);
            }
        };
        self.update_lifecycle_from_score(server_id);

        if let Some(advisory) = advisory {
            self.metrics.record_advisory();
            self.events.emit(EngineEvent::AdvisoryRaised {
                server_id: advisory.source,
                score: advisory.score_at_trigger,
                predicted_failure_eta_ms: advisory.predicted_failure_eta_ms,
            });
            if let Err(err) = self.dispatch(advisory) {
                tracing::warn!(server_id, error = %err, "advisory could not be dispatched");
            }
        }
        Ok(())
    }

    /// Latest reliability score for a server.
    pub fn current_score(&self, server_id: ServerId) -> Result<ReliabilityScore, EngineError> {
        self.estimator.current_score(server_id)
    }

    /// Long-horizon failure bookkeeping for a server.
    pub fn server_stats(&self, server_id: ServerId) -> Option<ServerStats> {
        self.estimator.stats(server_id)
    }

    /// Liveness input from the external failure detector.
    pub fn on_liveness_change(&self, server_id: ServerId, alive: bool) {
        self.watchdog.on_liveness_change(server_id, alive);
    }

    /// Operator cancellation of the active plan for `source`, if any.
    pub fn cancel_migration(&self, source: ServerId) -> bool {
        self.registry
            .active_for_source(source)
            .map(|handle| handle.abort(AbortReason::OperatorCancelled))
            .unwrap_or(false)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn fleet(&self) -> FleetSnapshot {
        self.fleet.snapshot()
    }

    pub fn registry(&self) -> &Arc<PlanRegistry> {
        &self.registry
    }

    /// Track threshold crossings in the server's lifecycle state without
    /// touching servers that are migrating, failed, or drained.
    fn update_lifecycle_from_score(&self, server_id: ServerId) {
        let Ok(score) = self.estimator.current_score(server_id) else {
            return;
        };
        match self.fleet.state_of(server_id) {
            Some(ServerState::Healthy) if score.value < self.cfg.reliability_threshold => {
                self.fleet.set_state(server_id, ServerState::Degraded);
                tracing::info!(server_id, score = score.value, "server degraded");
            }
            Some(ServerState::Degraded)
                if score.value
                    > self.cfg.reliability_threshold + self.cfg.hysteresis_margin =>
            {
                self.fleet.set_state(server_id, ServerState::Healthy);
                tracing::info!(server_id, score = score.value, "server healthy again");
            }
            _ => {}
        }
    }

    /// Turn an advisory into a running plan: pick a target, reserve capacity,
    /// register the plan, and hand it to the orchestrator.
    fn dispatch(&self, advisory: MigrationAdvisory) -> Result<Option<PlanId>, EngineError> {
        let fleet = self.fleet.snapshot();
        let services = fleet.services_on(advisory.source);
        if services.is_empty() {
            tracing::info!(
                server_id = advisory.source,
                "advisory for a server hosting no services; nothing to migrate"
            );
            return Ok(None);
        }
        let slots = services.len() as u32;

        let mut scores = BTreeMap::new();
        for server_id in fleet.servers.keys() {
            if let Ok(score) = self.estimator.current_score(*server_id) {
                scores.insert(*server_id, score.value);
            }
        }

        let Some(target) = planner::select_target(advisory.source, slots, &fleet, &scores) else {
            // Let the next qualifying sample raise the advisory again.
            self.estimator.rearm(advisory.source);
            return Err(EngineError::NoEligibleTarget(advisory.source));
        };
        if !self.fleet.reserve(target, slots) {
            self.estimator.rearm(advisory.source);
            return Err(EngineError::NoEligibleTarget(advisory.source));
        }

        let handle = match self.registry.begin(&advisory, target, services) {
            Ok(handle) => handle,
            Err(err) => {
                self.fleet.release(target, slots);
                return Err(err);
            }
        };
        tracing::info!(
            plan_id = handle.plan.plan_id,
            source = handle.plan.source,
            target,
            services = ?handle.plan.services,
            score = advisory.score_at_trigger,
            "migration plan dispatched"
        );
        self.orchestrator.spawn_plan(handle.clone());
        Ok(Some(handle.plan.plan_id))
    }
}
