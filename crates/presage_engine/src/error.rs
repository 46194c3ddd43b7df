//! Error taxonomy.
//!
//! Sample- and query-level errors are recoverable: the caller drops the
//! sample or retries later and no engine state changes. Plan-level failures
//! are expressed as [`AbortReason`] and always terminate the plan in
//! `Aborted` with an event carrying the reason.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ServerId;

/// Recoverable errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed telemetry; the sample was dropped and server state is unaffected.
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// Query for a server with no recorded samples (or not a fleet member).
    #[error("no reliability data for server {0}")]
    UnknownServer(ServerId),

    /// No healthy server satisfies the capacity constraints for this move.
    #[error("no eligible migration target for server {0}")]
    NoEligibleTarget(ServerId),

    /// A migration plan is already executing for this source server.
    #[error("server {0} already has an active migration plan")]
    PlanAlreadyActive(ServerId),
}

/// Why a migration plan terminated in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The watchdog saw the source die before cutover committed.
    SourceFailedMidMigration,
    /// The delta backlog never converged within the iteration budget.
    SyncDivergence,
    /// The cutover critical section exceeded its time budget.
    CutoverTimeout,
    /// The data-transfer collaborator reported a hard failure.
    TransferFailed,
    /// Explicit operator cancellation.
    OperatorCancelled,
}

impl AbortReason {
    /// Whether this abort must fall back to the reactive cold-migration path.
    ///
    /// A dead source always escalates. `SyncDivergence` escalates even with a
    /// live source: the live replication path has proven unable to converge,
    /// so cold re-provisioning is the only remaining way off the server.
    pub fn escalates(self, source_alive: bool) -> bool {
        match self {
            AbortReason::SourceFailedMidMigration => true,
            AbortReason::SyncDivergence => true,
            AbortReason::CutoverTimeout
            | AbortReason::TransferFailed
            | AbortReason::OperatorCancelled => !source_alive,
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::SourceFailedMidMigration => "source failed mid-migration",
            AbortReason::SyncDivergence => "sync divergence",
            AbortReason::CutoverTimeout => "cutover timeout",
            AbortReason::TransferFailed => "transfer failed",
            AbortReason::OperatorCancelled => "operator cancelled",
        };
        f.write_str(s)
    }
}
