//! End-to-end scenarios for the predictive migration engine.
//!
//! These mirror the engine's core claim: a server whose reliability trend
//! crosses the threshold gets its services live-migrated away well before
//! the actual failure, so the failure itself costs nothing; when the source
//! dies mid-migration the engine falls back to the reactive cold path.

mod common;

use std::time::Duration;

use common::{
    await_active_plan, await_no_active_plans, await_phase, harness, severity_at, signals,
    steep_severity_at,
};
use presage_engine::config::EngineConfig;
use presage_engine::error::AbortReason;
use presage_engine::events::EngineEvent;
use presage_engine::fleet::ServerState;
use presage_engine::orchestrator::MigrationPhase;
use presage_engine::routing::RoutingTable;
use presage_engine::transfer::SimTransferConfig;

const STEP_MS: u64 = 1_000;

/// Scenario A: reliability degrades from step 20, the advisory fires around
/// step 30, the migration completes, and the real failure at step 45 lands
/// on an already-drained server.
#[tokio::test(start_paused = true)]
async fn degrading_server_is_migrated_before_it_fails() {
    let h = harness(EngineConfig::default(), SimTransferConfig::default());
    for id in 1..=3 {
        h.engine.server_join(id, 4);
    }
    assert!(h.engine.deploy_service(100, 1));
    for _ in 0..10 {
        assert!(h.transfer.record_write(1));
    }
    let mut events = h.engine.subscribe_events();

    for step in 0..=44u64 {
        h.engine
            .submit_sample(1, step * STEP_MS, &signals(severity_at(step, 20)))
            .expect("sample for server 1");
        for id in 2..=3 {
            h.engine
                .submit_sample(id, step * STEP_MS, &signals(0.01))
                .expect("healthy sample");
        }
        if step == 19 {
            assert_eq!(h.engine.metrics().advisories_raised, 0);
        }
        if step == 40 {
            assert_eq!(h.engine.metrics().advisories_raised, 1);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    await_no_active_plans(&h.engine).await;

    let metrics = h.engine.metrics();
    assert_eq!(metrics.advisories_raised, 1);
    assert_eq!(metrics.migrations_completed, 1);
    assert_eq!(metrics.migrations_aborted, 0);

    // Equal scores and loads on servers 2 and 3: determinism picks 2.
    assert_eq!(h.routing.authority(100), Some(2));
    // Target state equals the source state at the cutover instant.
    assert_eq!(h.transfer.replica(1, 2), h.transfer.log(1));
    let fleet = h.engine.fleet();
    assert_eq!(fleet.servers.get(&1).unwrap().state, ServerState::Drained);
    assert_eq!(fleet.placements.get(&100), Some(&2));

    // Step 45: the predicted failure actually happens, after the fact.
    h.engine.on_liveness_change(1, false);
    let metrics = h.engine.metrics();
    assert_eq!(metrics.failures_preempted, 1);
    assert_eq!(metrics.cold_escalations, 0);
    assert_eq!(metrics.migrations_aborted, 0);
    assert!(h.escalation.calls().is_empty());

    let mut saw_preempted = false;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::FailurePreempted { server_id } => {
                assert_eq!(server_id, 1);
                saw_preempted = true;
            }
            EngineEvent::MigrationCompleted { .. } => saw_completed = true,
            _ => {}
        }
    }
    assert!(saw_completed);
    assert!(saw_preempted);
}

/// Scenario B: the source dies at step 10 while the plan is still
/// replicating; the plan aborts and every service escalates to the cold path.
#[tokio::test(start_paused = true)]
async fn source_death_during_replication_falls_back_to_cold_migration() {
    let h = harness(
        EngineConfig::default(),
        SimTransferConfig {
            bulk_copy_polls: 10_000,
            ..SimTransferConfig::default()
        },
    );
    for id in 1..=3 {
        h.engine.server_join(id, 4);
    }
    assert!(h.engine.deploy_service(100, 1));

    for step in 0..=9u64 {
        h.engine
            .submit_sample(1, step * STEP_MS, &signals(steep_severity_at(step, 5)))
            .expect("sample for server 1");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    await_phase(&h.engine, 1, MigrationPhase::Replicating).await;

    // Latched estimator plus the plan registry: more bad samples for the
    // same source never stack a second plan.
    h.engine
        .submit_sample(1, 10 * STEP_MS, &signals(0.6))
        .expect("sample while migrating");
    assert_eq!(h.engine.metrics().advisories_raised, 1);
    assert_eq!(h.engine.registry().active_count(), 1);

    h.engine.on_liveness_change(1, false);
    await_no_active_plans(&h.engine).await;

    let metrics = h.engine.metrics();
    assert_eq!(metrics.migrations_aborted, 1);
    assert_eq!(metrics.migrations_completed, 0);
    assert_eq!(metrics.failures_preempted, 0);
    assert_eq!(
        h.escalation.calls(),
        vec![(100, 1, AbortReason::SourceFailedMidMigration)]
    );
    // Routing never moved: the cold path re-provisions from the source side.
    assert_eq!(h.routing.authority(100), Some(1));
    let fleet = h.engine.fleet();
    assert_eq!(fleet.servers.get(&1).unwrap().state, ServerState::Failed);
    assert_eq!(fleet.servers.get(&2).unwrap().reserved, 0);
    assert_eq!(fleet.servers.get(&3).unwrap().reserved, 0);
}

/// Scenario C: the delta backlog refuses to converge; the plan aborts with
/// divergence, escalates, and routing still points at the live source.
#[tokio::test(start_paused = true)]
async fn sync_divergence_aborts_and_escalates_with_routing_on_source() {
    let mut cfg = EngineConfig::default();
    cfg.max_sync_iterations = 5;
    let h = harness(
        cfg,
        SimTransferConfig {
            bulk_copy_polls: 1,
            delta_drain_per_round: 2,
            writes_per_delta_round: 4,
            ..SimTransferConfig::default()
        },
    );
    for id in 1..=2 {
        h.engine.server_join(id, 4);
    }
    assert!(h.engine.deploy_service(100, 1));
    for _ in 0..8 {
        assert!(h.transfer.record_write(1));
    }

    for step in 0..=9u64 {
        h.engine
            .submit_sample(1, step * STEP_MS, &signals(steep_severity_at(step, 5)))
            .expect("sample for server 1");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    await_active_plan(&h.engine, 1).await;
    await_no_active_plans(&h.engine).await;

    let metrics = h.engine.metrics();
    assert_eq!(metrics.migrations_aborted, 1);
    assert_eq!(metrics.migrations_completed, 0);
    assert_eq!(
        h.escalation.calls(),
        vec![(100, 1, AbortReason::SyncDivergence)]
    );
    assert_eq!(h.routing.authority(100), Some(1));
    let fleet = h.engine.fleet();
    // Source alive and still suspect.
    assert_eq!(fleet.servers.get(&1).unwrap().state, ServerState::Degraded);
    assert_eq!(fleet.servers.get(&2).unwrap().reserved, 0);
}

/// Planning failures re-arm the estimator: a source that keeps degrading
/// keeps raising advisories until a target shows up.
#[tokio::test(start_paused = true)]
async fn no_eligible_target_rearms_for_later_advisories() {
    let h = harness(EngineConfig::default(), SimTransferConfig::default());
    h.engine.server_join(1, 4);
    assert!(h.engine.deploy_service(100, 1));

    for step in 0..=12u64 {
        h.engine
            .submit_sample(1, step * STEP_MS, &signals(steep_severity_at(step, 3)))
            .expect("sample for server 1");
    }

    let metrics = h.engine.metrics();
    assert!(metrics.advisories_raised >= 2, "kept re-raising advisories");
    assert_eq!(metrics.migrations_completed, 0);
    assert_eq!(h.engine.registry().active_count(), 0);
    assert_eq!(h.routing.authority(100), Some(1));
}

/// Operator cancellation aborts a live plan without escalating.
#[tokio::test(start_paused = true)]
async fn operator_cancellation_aborts_without_escalation() {
    let h = harness(
        EngineConfig::default(),
        SimTransferConfig {
            bulk_copy_polls: 10_000,
            ..SimTransferConfig::default()
        },
    );
    for id in 1..=2 {
        h.engine.server_join(id, 4);
    }
    assert!(h.engine.deploy_service(100, 1));

    assert!(!h.engine.cancel_migration(1), "no plan yet");
    for step in 0..=9u64 {
        h.engine
            .submit_sample(1, step * STEP_MS, &signals(steep_severity_at(step, 5)))
            .expect("sample for server 1");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    await_active_plan(&h.engine, 1).await;

    assert!(h.engine.cancel_migration(1));
    await_no_active_plans(&h.engine).await;

    assert_eq!(h.engine.metrics().migrations_aborted, 1);
    assert!(h.escalation.calls().is_empty());
    assert_eq!(h.routing.authority(100), Some(1));
    assert_eq!(
        h.engine.fleet().servers.get(&1).unwrap().state,
        ServerState::Degraded
    );
}

/// Duplicate submission of the same sample never double-counts.
#[tokio::test(start_paused = true)]
async fn duplicate_sample_submission_is_idempotent() {
    let h = harness(EngineConfig::default(), SimTransferConfig::default());
    h.engine.server_join(1, 4);

    h.engine.submit_sample(1, 1_000, &signals(0.1)).unwrap();
    h.engine.submit_sample(1, 2_000, &signals(0.2)).unwrap();
    let before = h.engine.current_score(1).unwrap();

    h.engine.submit_sample(1, 2_000, &signals(0.2)).unwrap();
    let after = h.engine.current_score(1).unwrap();
    assert_eq!(before.value, after.value);
    assert_eq!(before.at_ms, after.at_ms);
}

/// A revived server rejoins healthy and can immediately host migrations.
#[tokio::test(start_paused = true)]
async fn failed_server_rejoins_healthy_after_revival() {
    let h = harness(EngineConfig::default(), SimTransferConfig::default());
    for id in 1..=2 {
        h.engine.server_join(id, 4);
    }
    h.engine.on_liveness_change(2, false);
    assert_eq!(
        h.engine.fleet().servers.get(&2).unwrap().state,
        ServerState::Failed
    );

    h.engine.on_liveness_change(2, true);
    let fleet = h.engine.fleet();
    assert_eq!(fleet.servers.get(&2).unwrap().state, ServerState::Healthy);
    assert!(fleet.servers.get(&2).unwrap().alive);
}
