//! Predictive live-migration engine.
//!
//! The engine watches per-server telemetry, estimates each server's
//! remaining-reliability trend, and moves stateful services off a server
//! *before* it fails: bulk replication and delta catch-up happen while the
//! source is still alive, so the final cutover is a short atomic repoint
//! instead of a cold re-provision after the fact.
//!
//! The API surface is intentionally small: callers supply a [`transfer::DataTransfer`]
//! and a [`routing::RoutingTable`] collaborator, then feed samples and
//! liveness changes through [`Engine`].

pub mod config;
pub mod error;
pub mod estimator;
pub mod events;
pub mod fleet;
pub mod orchestrator;
pub mod planner;
pub mod routing;
pub mod transfer;
pub mod watchdog;

mod engine;

pub use engine::Engine;

use std::time::{SystemTime, UNIX_EPOCH};

/// Logical identifier for a fleet server.
pub type ServerId = u64;
/// Logical identifier for a hosted service.
pub type ServiceId = u64;
/// Identifier for a migration plan.
pub type PlanId = u64;

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
