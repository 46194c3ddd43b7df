//! Engine configuration.
//!
//! Every numeric that shapes a migration decision is tunable here; the
//! defaults reproduce the illustrative trace used by the workload driver
//! (advisory around step 30 for a failure at step 45) but carry no special
//! meaning beyond that.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A telemetry signal the estimator accepts, with its valid range and weight.
///
/// Values at `min` map to severity 0 (fully healthy), values at `max` to
/// severity 1. Samples carrying unknown names, missing declared names, or
/// values outside `[min, max]` are rejected as invalid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
    /// Relative weight of this signal in the combined severity.
    pub weight: f64,
}

impl SignalSpec {
    pub fn new(name: impl Into<String>, min: f64, max: f64, weight: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            weight,
        }
    }
}

/// Tuning for the estimator, planner, and orchestrator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reliability score below which migration is armed.
    pub reliability_threshold: f64,
    /// Recovery margin above the threshold before a latched server re-arms.
    pub hysteresis_margin: f64,
    /// Sliding sample window size per server.
    pub window_size: usize,
    /// Consecutive non-increasing-trend samples required before triggering.
    pub trend_samples: usize,
    /// EMA smoothing factor for the level term (0 < alpha <= 1).
    pub ema_alpha: f64,
    /// Weight of the fitted slope in the combined score.
    pub trend_weight: f64,
    /// Delta-sync iterations allowed before declaring divergence.
    pub max_sync_iterations: u32,
    /// Delta backlog (entries) at or below which cutover may begin.
    pub sync_lag_bound: u64,
    /// Budget for the cutover critical section.
    pub cutover_budget: Duration,
    /// Poll interval while waiting on bulk copy and between delta rounds.
    pub replicate_poll_interval: Duration,
    /// Samples older than this are evicted from the window.
    pub sample_horizon: Duration,
    /// Declared telemetry signals.
    pub signals: Vec<SignalSpec>,
}

impl EngineConfig {
    /// Default signal set; deployments normally replace this with their own.
    pub fn default_signals() -> Vec<SignalSpec> {
        vec![
            SignalSpec::new("cpu_error_rate", 0.0, 1.0, 1.0),
            SignalSpec::new("disk_latency_p99", 0.0, 1_000.0, 1.0),
            SignalSpec::new("heartbeat_miss_count", 0.0, 10.0, 1.0),
        ]
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reliability_threshold: 0.95,
            hysteresis_margin: 0.02,
            window_size: 30,
            trend_samples: 3,
            ema_alpha: 0.3,
            trend_weight: 4.0,
            max_sync_iterations: 8,
            sync_lag_bound: 1,
            cutover_budget: Duration::from_millis(2_000),
            replicate_poll_interval: Duration::from_millis(50),
            sample_horizon: Duration::from_millis(120_000),
            signals: Self::default_signals(),
        }
    }
}
