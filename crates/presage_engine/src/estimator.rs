//! Per-server reliability estimation and migration triggering.
//!
//! Each server carries a bounded window of normalized telemetry samples. On
//! every accepted sample the score is recomputed as a smoothed level (EMA of
//! instantaneous health) plus a trend term (least-squares slope over the
//! window). Crossing the trigger threshold with a sustained non-increasing
//! trend raises exactly one [`MigrationAdvisory`]; the server then stays
//! latched until the score recovers above `threshold + hysteresis_margin`,
//! so oscillation near the boundary cannot raise advisory storms.
//!
//! Ordering policy: samples are serialized per server; a sample whose
//! timestamp is at or before the latest accepted one is dropped, which makes
//! duplicate submission a no-op.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ServerId;

/// Derived reliability value for one server at one instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReliabilityScore {
    /// Bounded score in `[0, 1]`.
    pub value: f64,
    /// Fitted health slope per sample over the current window.
    pub slope: f64,
    /// Timestamp of the sample that produced this score.
    pub at_ms: u64,
}

/// Signal that a server crossed the migration-trigger threshold.
///
/// Created at most once per continuous crossing interval and consumed
/// exactly once by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationAdvisory {
    pub source: ServerId,
    pub score_at_trigger: f64,
    /// Linear extrapolation of the score to zero, in milliseconds from the
    /// triggering sample. Informational only.
    pub predicted_failure_eta_ms: Option<u64>,
    pub at_ms: u64,
}

/// Long-horizon failure bookkeeping for one server, fed by the watchdog.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ServerStats {
    pub first_seen_ms: u64,
    pub failures: u64,
    pub last_failure_ms: Option<u64>,
}

impl ServerStats {
    /// Coarse mean-time-between-failures estimate over the observed span.
    pub fn mtbf_ms(&self) -> Option<u64> {
        if self.failures == 0 {
            return None;
        }
        let span = self.last_failure_ms?.saturating_sub(self.first_seen_ms);
        Some(span / self.failures)
    }
}

#[derive(Debug, Default)]
struct ServerWindow {
    /// `(timestamp_ms, instantaneous_health)` pairs, oldest first.
    samples: VecDeque<(u64, f64)>,
    ema: Option<f64>,
    score: Option<ReliabilityScore>,
    /// Advisory emitted; suppressed until the score recovers past the margin.
    latched: bool,
    /// Consecutive below-threshold samples whose score did not increase.
    non_increasing: usize,
    stats: ServerStats,
}

/// Reliability estimator over an owned table of per-server windows.
///
/// Entries for different servers never contend: the table is read-locked for
/// lookup and each window has its own mutex, which also serializes sample
/// processing per server.
pub struct ReliabilityEstimator {
    cfg: Arc<EngineConfig>,
    entries: RwLock<BTreeMap<ServerId, Arc<Mutex<ServerWindow>>>>,
}

impl ReliabilityEstimator {
    pub fn new(cfg: Arc<EngineConfig>) -> Self {
        Self {
            cfg,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create the window for a joining server.
    pub fn register(&self, server_id: ServerId, now_ms: u64) {
        let mut entries = self.entries.write().unwrap();
        entries.entry(server_id).or_insert_with(|| {
            Arc::new(Mutex::new(ServerWindow {
                stats: ServerStats {
                    first_seen_ms: now_ms,
                    ..ServerStats::default()
                },
                ..ServerWindow::default()
            }))
        });
    }

    /// Drop all state for a permanently removed server.
    pub fn remove(&self, server_id: ServerId) {
        self.entries.write().unwrap().remove(&server_id);
    }

    /// Clear the sample window after a server comes back from a failure.
    /// Failure bookkeeping survives the reset.
    pub fn reset_window(&self, server_id: ServerId) {
        if let Some(entry) = self.entry(server_id) {
            let mut window = entry.lock().unwrap();
            window.samples.clear();
            window.ema = None;
            window.score = None;
            window.latched = false;
            window.non_increasing = 0;
        }
    }

    /// Record a failure observation (liveness dropped).
    pub fn record_failure(&self, server_id: ServerId, now_ms: u64) {
        if let Some(entry) = self.entry(server_id) {
            let mut window = entry.lock().unwrap();
            window.stats.failures += 1;
            window.stats.last_failure_ms = Some(now_ms);
        }
    }

    /// Re-arm a latched server whose advisory could not be acted on, so the
    /// next qualifying sample may trigger again.
    pub fn rearm(&self, server_id: ServerId) {
        if let Some(entry) = self.entry(server_id) {
            entry.lock().unwrap().latched = false;
        }
    }

    pub fn stats(&self, server_id: ServerId) -> Option<ServerStats> {
        self.entry(server_id).map(|e| e.lock().unwrap().stats)
    }

    /// Latest computed score; `UnknownServer` before any accepted sample.
    pub fn current_score(&self, server_id: ServerId) -> Result<ReliabilityScore, EngineError> {
        self.entry(server_id)
            .and_then(|e| e.lock().unwrap().score)
            .ok_or(EngineError::UnknownServer(server_id))
    }

    /// Ingest one sample. Returns an advisory when this sample triggered the
    /// migration threshold; `Ok(None)` covers both "recorded, no trigger"
    /// and "dropped as stale/duplicate".
    pub fn record_sample(
        &self,
        server_id: ServerId,
        timestamp_ms: u64,
        signals: &BTreeMap<String, f64>,
    ) -> Result<Option<MigrationAdvisory>, EngineError> {
        let health = self.validate(signals)?;

        let entry = match self.entry(server_id) {
            Some(entry) => entry,
            None => {
                // First contact outside an explicit join; create the window.
                self.register(server_id, timestamp_ms);
                self.entry(server_id)
                    .ok_or(EngineError::UnknownServer(server_id))?
            }
        };
        let mut window = entry.lock().unwrap();

        if let Some(&(last_ts, _)) = window.samples.back() {
            if timestamp_ms <= last_ts {
                tracing::debug!(
                    server_id,
                    timestamp_ms,
                    last_ts,
                    "dropping stale or duplicate sample"
                );
                return Ok(None);
            }
        }

        window.samples.push_back((timestamp_ms, health));
        let horizon_ms = self.cfg.sample_horizon.as_millis().min(u128::from(u64::MAX)) as u64;
        while window.samples.len() > self.cfg.window_size {
            window.samples.pop_front();
        }
        while let Some(&(ts, _)) = window.samples.front() {
            if ts.saturating_add(horizon_ms) < timestamp_ms && window.samples.len() > 1 {
                window.samples.pop_front();
            } else {
                break;
            }
        }

        let ema = match window.ema {
            Some(prev) => self.cfg.ema_alpha * health + (1.0 - self.cfg.ema_alpha) * prev,
            None => health,
        };
        window.ema = Some(ema);

        let slope = fitted_slope(&window.samples);
        let value = (ema + self.cfg.trend_weight * slope).clamp(0.0, 1.0);
        let score = ReliabilityScore {
            value,
            slope,
            at_ms: timestamp_ms,
        };

        // The run only accumulates inside a below-threshold excursion, and a
        // single-sample dip recovers on the next sample (the score rises
        // again), resetting it; only a sustained decline reaches the trigger.
        if value < self.cfg.reliability_threshold {
            match window.score {
                Some(prev) if value > prev.value => window.non_increasing = 0,
                _ => window.non_increasing += 1,
            }
        } else {
            window.non_increasing = 0;
        }
        window.score = Some(score);

        if window.latched {
            if value > self.cfg.reliability_threshold + self.cfg.hysteresis_margin {
                window.latched = false;
                tracing::info!(server_id, score = value, "reliability recovered, re-armed");
            }
            return Ok(None);
        }

        let triggered = value < self.cfg.reliability_threshold
            && window.non_increasing >= self.cfg.trend_samples.max(1);
        if !triggered {
            return Ok(None);
        }

        window.latched = true;
        let eta = predicted_failure_eta_ms(&window.samples, score);
        tracing::warn!(
            server_id,
            score = value,
            slope,
            predicted_failure_eta_ms = ?eta,
            "reliability crossed migration threshold"
        );
        Ok(Some(MigrationAdvisory {
            source: server_id,
            score_at_trigger: value,
            predicted_failure_eta_ms: eta,
            at_ms: timestamp_ms,
        }))
    }

    fn entry(&self, server_id: ServerId) -> Option<Arc<Mutex<ServerWindow>>> {
        self.entries.read().unwrap().get(&server_id).cloned()
    }

    /// Validate the signal vector against the declared specs and fold it
    /// into an instantaneous health value in `[0, 1]`.
    fn validate(&self, signals: &BTreeMap<String, f64>) -> Result<f64, EngineError> {
        if signals.is_empty() {
            return Err(EngineError::InvalidSample("empty signal vector".into()));
        }
        for name in signals.keys() {
            if !self.cfg.signals.iter().any(|s| s.name == *name) {
                return Err(EngineError::InvalidSample(format!("unknown signal {name}")));
            }
        }

        let mut weighted_severity = 0.0;
        let mut total_weight = 0.0;
        for spec in &self.cfg.signals {
            let value = *signals.get(&spec.name).ok_or_else(|| {
                EngineError::InvalidSample(format!("missing signal {}", spec.name))
            })?;
            if !value.is_finite() {
                return Err(EngineError::InvalidSample(format!(
                    "non-finite value for {}",
                    spec.name
                )));
            }
            if value < spec.min || value > spec.max {
                return Err(EngineError::InvalidSample(format!(
                    "{} = {value} outside [{}, {}]",
                    spec.name, spec.min, spec.max
                )));
            }
            let range = spec.max - spec.min;
            let severity = if range > 0.0 {
                (value - spec.min) / range
            } else {
                0.0
            };
            weighted_severity += spec.weight * severity;
            total_weight += spec.weight;
        }
        if total_weight <= 0.0 {
            return Err(EngineError::InvalidSample("no weighted signals".into()));
        }
        Ok((1.0 - weighted_severity / total_weight).clamp(0.0, 1.0))
    }
}

/// Least-squares slope of health per sample step over the window.
fn fitted_slope(samples: &VecDeque<(u64, f64)>) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = samples.iter().map(|(_, h)| *h).sum::<f64>() / n_f;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, (_, h)) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (h - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn predicted_failure_eta_ms(
    samples: &VecDeque<(u64, f64)>,
    score: ReliabilityScore,
) -> Option<u64> {
    if score.slope >= 0.0 || samples.len() < 2 {
        return None;
    }
    let first_ts = samples.front()?.0;
    let last_ts = samples.back()?.0;
    let avg_interval_ms = (last_ts.saturating_sub(first_ts)) as f64 / (samples.len() - 1) as f64;
    let eta_samples = score.value / -score.slope;
    Some((eta_samples * avg_interval_ms) as u64)
}
