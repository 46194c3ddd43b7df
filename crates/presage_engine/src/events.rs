//! Observability surface: broadcast events and in-process counters.
//!
//! Every externally visible transition emits exactly one [`EngineEvent`];
//! there is no silent sub-state mutation. Counters are lightweight atomics
//! so they can be bumped from hot paths without coordination.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AbortReason;
use crate::orchestrator::MigrationPhase;
use crate::{PlanId, ServerId, ServiceId};

/// Events emitted by the engine, one per observable transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A server crossed the migration-trigger threshold.
    AdvisoryRaised {
        server_id: ServerId,
        score: f64,
        predicted_failure_eta_ms: Option<u64>,
    },
    /// A migration plan moved between phases.
    MigrationStateChanged {
        plan_id: PlanId,
        from: MigrationPhase,
        to: MigrationPhase,
    },
    /// A plan reached `Completed`; `downtime_ms` is the cutover duration.
    MigrationCompleted { plan_id: PlanId, downtime_ms: u64 },
    /// A plan terminated in `Aborted`.
    MigrationAborted {
        plan_id: PlanId,
        reason: AbortReason,
    },
    /// A server failed after its services had already been migrated away.
    FailurePreempted { server_id: ServerId },
    /// The reactive fallback path was invoked for a service.
    ColdMigrationEscalated {
        service_id: ServiceId,
        source: ServerId,
        reason: AbortReason,
    },
}

/// Fan-out bus for engine events.
///
/// Sends never block; if no subscriber is attached the event is dropped,
/// which is fine because the counters below keep the aggregate story.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Aggregate counters for engine activity.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Advisories raised by the estimator.
    advisories_raised: AtomicU64,
    /// Plans that reached `Completed`.
    migrations_completed: AtomicU64,
    /// Plans that terminated in `Aborted`.
    migrations_aborted: AtomicU64,
    /// Failures that occurred after the service had been migrated away.
    failures_preempted: AtomicU64,
    /// Services handed to the cold-migration fallback.
    cold_escalations: AtomicU64,
    /// Telemetry samples rejected as invalid.
    invalid_samples: AtomicU64,
    /// Sum of measured cutover downtime across completed plans.
    cutover_downtime_ms_total: AtomicU64,
}

impl EngineMetrics {
    pub fn record_advisory(&self) {
        self.advisories_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, downtime_ms: u64) {
        self.migrations_completed.fetch_add(1, Ordering::Relaxed);
        self.cutover_downtime_ms_total
            .fetch_add(downtime_ms, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.migrations_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preempted(&self) {
        self.failures_preempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cold_escalation(&self) {
        self.cold_escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_sample(&self) {
        self.invalid_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            advisories_raised: self.advisories_raised.load(Ordering::Relaxed),
            migrations_completed: self.migrations_completed.load(Ordering::Relaxed),
            migrations_aborted: self.migrations_aborted.load(Ordering::Relaxed),
            failures_preempted: self.failures_preempted.load(Ordering::Relaxed),
            cold_escalations: self.cold_escalations.load(Ordering::Relaxed),
            invalid_samples: self.invalid_samples.load(Ordering::Relaxed),
            cutover_downtime_ms_total: self.cutover_downtime_ms_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub advisories_raised: u64,
    pub migrations_completed: u64,
    pub migrations_aborted: u64,
    pub failures_preempted: u64,
    pub cold_escalations: u64,
    pub invalid_samples: u64,
    pub cutover_downtime_ms_total: u64,
}
