//! Migration target selection.
//!
//! The planner is a pure function over a fleet snapshot and the current
//! reliability scores: given an advisory it picks the healthiest server with
//! enough spare capacity, with deterministic tie-breaking so test runs are
//! reproducible. It holds no state once the plan is dispatched.

use std::collections::BTreeMap;

use crate::fleet::{FleetSnapshot, ServerState};
use crate::ServerId;

/// Select a migration target for `source` needing `slots` service slots.
///
/// Eligible: `Healthy`, alive, not the source, spare capacity >= `slots`.
/// Ranking: highest reliability score, then lowest current load, then lowest
/// server id. Servers without a computed score rank as fully reliable; a
/// server that has never been observed degrading has nothing against it.
pub fn select_target(
    source: ServerId,
    slots: u32,
    fleet: &FleetSnapshot,
    scores: &BTreeMap<ServerId, f64>,
) -> Option<ServerId> {
    let mut candidates: Vec<(ServerId, f64, u32)> = fleet
        .servers
        .values()
        .filter(|info| {
            info.server_id != source
                && info.alive
                && info.state == ServerState::Healthy
                && fleet.spare_capacity(info.server_id) >= slots
        })
        .map(|info| {
            let score = scores.get(&info.server_id).copied().unwrap_or(1.0);
            (info.server_id, score, fleet.load(info.server_id))
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| a.2.cmp(&b.2))
            .then_with(|| a.0.cmp(&b.0))
    });
    candidates.first().map(|(id, _, _)| *id)
}
