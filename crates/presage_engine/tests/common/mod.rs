//! Shared helpers for integration tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use presage_engine::config::EngineConfig;
use presage_engine::error::AbortReason;
use presage_engine::orchestrator::{EscalationHook, MigrationPhase};
use presage_engine::routing::InMemoryRouting;
use presage_engine::transfer::{SimTransfer, SimTransferConfig};
use presage_engine::{Engine, ServerId, ServiceId};

/// Escalation hook that records every cold-migration request.
pub struct RecordingEscalation {
    calls: Mutex<Vec<(ServiceId, ServerId, AbortReason)>>,
}

impl RecordingEscalation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(ServiceId, ServerId, AbortReason)> {
        self.calls.lock().unwrap().clone()
    }
}

impl EscalationHook for RecordingEscalation {
    fn escalate_cold_migration(&self, service_id: ServiceId, source: ServerId, reason: AbortReason) {
        self.calls.lock().unwrap().push((service_id, source, reason));
    }
}

pub struct Harness {
    pub engine: Engine,
    pub transfer: Arc<SimTransfer>,
    pub routing: Arc<InMemoryRouting>,
    pub escalation: Arc<RecordingEscalation>,
}

pub fn harness(cfg: EngineConfig, transfer_cfg: SimTransferConfig) -> Harness {
    let transfer = Arc::new(SimTransfer::new(transfer_cfg));
    let routing = Arc::new(InMemoryRouting::new());
    let escalation = RecordingEscalation::new();
    let engine = Engine::new(cfg, transfer.clone(), routing.clone(), escalation.clone());
    Harness {
        engine,
        transfer,
        routing,
        escalation,
    }
}

/// Build a full signal vector for the default signal set from one severity.
pub fn signals(severity: f64) -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("cpu_error_rate".to_string(), severity.clamp(0.0, 1.0)),
        (
            "disk_latency_p99".to_string(),
            (severity * 1_000.0).clamp(0.0, 1_000.0),
        ),
        (
            "heartbeat_miss_count".to_string(),
            (severity * 10.0).clamp(0.0, 10.0),
        ),
    ])
}

/// Severity trace for the diagram scenario: healthy until `degrade_start`,
/// then a steady ramp.
pub fn severity_at(step: u64, degrade_start: u64) -> f64 {
    if step < degrade_start {
        0.01
    } else {
        (0.01 + (step - degrade_start) as f64 * 0.01).min(0.95)
    }
}

/// Abrupt collapse: healthy until `degrade_start`, then a fast ramp that
/// crosses the trigger threshold within a few samples.
pub fn steep_severity_at(step: u64, degrade_start: u64) -> f64 {
    if step < degrade_start {
        0.01
    } else {
        (0.15 * (step - degrade_start + 1) as f64).min(0.95)
    }
}

/// Wait until every in-flight plan reached a terminal phase.
pub async fn await_no_active_plans(engine: &Engine) {
    while engine.registry().active_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until a plan is active for `source`.
pub async fn await_active_plan(engine: &Engine, source: ServerId) {
    while engine.registry().active_for_source(source).is_none() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Wait until the active plan for `source` reaches `phase`.
pub async fn await_phase(engine: &Engine, source: ServerId, phase: MigrationPhase) {
    loop {
        if let Some(handle) = engine.registry().active_for_source(source) {
            if handle.phase() == phase {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
