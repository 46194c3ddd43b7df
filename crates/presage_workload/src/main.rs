//! Workload generator for exercising the presage engine.
//!
//! This binary synthesizes a fleet, scripts a degradation ramp and failure
//! step for one server, feeds per-step telemetry into the engine, and prints
//! a summary comparing the proactive downtime actually measured against the
//! reactive cold-migration baseline the engine exists to avoid.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use presage_engine::config::EngineConfig;
use presage_engine::error::AbortReason;
use presage_engine::orchestrator::EscalationHook;
use presage_engine::routing::{InMemoryRouting, RoutingTable};
use presage_engine::transfer::{SimTransfer, SimTransferConfig};
use presage_engine::{Engine, ServerId, ServiceId};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "presage-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of simulated servers.
    #[arg(long, env = "PRESAGE_SERVERS", default_value_t = 6)]
    servers: u64,

    /// Simulated steps to run (one telemetry sample per server per step).
    #[arg(long, env = "PRESAGE_STEPS", default_value_t = 90)]
    steps: u64,

    /// RNG seed for the healthy-noise traces.
    #[arg(long, env = "PRESAGE_SEED", default_value_t = 42)]
    seed: u64,

    /// Step at which the degrading server's telemetry starts ramping.
    #[arg(long, env = "PRESAGE_DEGRADE_START", default_value_t = 20)]
    degrade_start: u64,

    /// Step at which the degrading server actually dies.
    #[arg(long, env = "PRESAGE_FAILURE_STEP", default_value_t = 45)]
    failure_step: u64,

    /// Assumed downtime of one reactive cold migration (ms).
    #[arg(long, env = "PRESAGE_COLD_MIGRATION_MS", default_value_t = 45_000)]
    cold_migration_ms: u64,

    /// Reliability score below which migration is armed.
    #[arg(long, env = "PRESAGE_RELIABILITY_THRESHOLD", default_value_t = 0.95)]
    reliability_threshold: f64,

    /// Sliding sample window size per server.
    #[arg(long, env = "PRESAGE_WINDOW_SIZE", default_value_t = 30)]
    window_size: usize,

    /// Cutover critical-section budget (ms).
    #[arg(long, env = "PRESAGE_CUTOVER_BUDGET_MS", default_value_t = 2_000)]
    cutover_budget_ms: u64,

    /// Wall-clock pacing per simulated step (ms).
    #[arg(long, env = "PRESAGE_STEP_PACING_MS", default_value_t = 50)]
    step_pacing_ms: u64,

    /// Print every engine event as one JSON line on stdout.
    #[arg(long, default_value_t = false)]
    json_events: bool,
}

/// Escalation hook that charges the assumed cold-migration downtime for
/// every service that falls back to the reactive path.
struct ColdPathAccounting {
    cold_migration_ms: u64,
    charged: Mutex<Vec<(ServiceId, ServerId, AbortReason)>>,
}

impl ColdPathAccounting {
    fn new(cold_migration_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            cold_migration_ms,
            charged: Mutex::new(Vec::new()),
        })
    }

    fn escalated_services(&self) -> u64 {
        self.charged.lock().unwrap().len() as u64
    }

    fn charged_ms(&self) -> u64 {
        self.escalated_services() * self.cold_migration_ms
    }
}

impl EscalationHook for ColdPathAccounting {
    fn escalate_cold_migration(&self, service_id: ServiceId, source: ServerId, reason: AbortReason) {
        tracing::warn!(service_id, source, %reason, "service fell back to cold migration");
        self.charged
            .lock()
            .unwrap()
            .push((service_id, source, reason));
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn service_for(server: ServerId) -> ServiceId {
    100 + server
}

fn signal_vector(severity: f64) -> BTreeMap<String, f64> {
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

async fn run(args: RunArgs) -> anyhow::Result<()> {
    if args.servers < 2 {
        anyhow::bail!("the workload needs at least two servers to migrate between");
    }

    let mut cfg = EngineConfig::default();
    cfg.reliability_threshold = args.reliability_threshold;
    cfg.window_size = args.window_size.max(2);
    cfg.cutover_budget = Duration::from_millis(args.cutover_budget_ms.max(1));

    let transfer = Arc::new(SimTransfer::new(SimTransferConfig::default()));
    let routing = Arc::new(InMemoryRouting::new());
    let escalation = ColdPathAccounting::new(args.cold_migration_ms);
    let engine = Engine::new(cfg, transfer.clone(), routing.clone(), escalation.clone());

    if args.json_events {
        let mut events = engine.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => tracing::warn!(error = %err, "event serialization failed"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // One service per server; server 1 is the one that will fail.
    let doomed: ServerId = 1;
    for id in 1..=args.servers {
        engine.server_join(id, 4);
    }
    for id in 1..=args.servers {
        if !engine.deploy_service(service_for(id), id) {
            anyhow::bail!("failed to deploy service on server {id}");
        }
    }

    let mut rng = SmallRng::seed_from_u64(args.seed);
    for id in 1..=args.servers {
        for _ in 0..rng.gen_range(32..64) {
            transfer.record_write(id);
        }
    }

    let mut failure_injected = false;
    for step in 0..args.steps {
        let timestamp_ms = step * 1_000;
        for id in 1..=args.servers {
            if failure_injected && id == doomed {
                // Dead servers emit no telemetry.
                continue;
            }
            let severity = if id == doomed && step >= args.degrade_start {
                (0.01 + (step - args.degrade_start) as f64 * 0.01).min(0.95)
            } else {
                rng.gen_range(0.0..0.05)
            };
            if let Err(err) = engine.submit_sample(id, timestamp_ms, &signal_vector(severity)) {
                tracing::debug!(server_id = id, error = %err, "sample rejected");
            }
        }

        // Writer traffic follows the routing authority; during a cutover the
        // paused source rejects the write and the client simply retries the
        // next step against whoever is authoritative then.
        for id in 1..=args.servers {
            if let Some(owner) = routing.authority(service_for(id)) {
                let _ = transfer.record_write(owner);
            }
        }

        if step == args.failure_step && !failure_injected {
            failure_injected = true;
            tracing::info!(server_id = doomed, step, "injecting server failure");
            engine.on_liveness_change(doomed, false);
        }

        tokio::time::sleep(Duration::from_millis(args.step_pacing_ms)).await;
    }

    // Let in-flight plans settle before reporting.
    while engine.registry().active_count() > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let metrics = engine.metrics();
    let proactive_ms = metrics.cutover_downtime_ms_total + escalation.charged_ms();
    // One service per server in this workload, so the injected failure puts
    // exactly one service on the floor in the reactive baseline.
    let affected_services: u64 = if failure_injected { 1 } else { 0 };
    let reactive_ms = affected_services * args.cold_migration_ms;

    println!();
    println!("==== presage workload summary ====");
    println!(
        "servers: {}  steps: {}  seed: {}  degrade_start: {}  failure_step: {}",
        args.servers, args.steps, args.seed, args.degrade_start, args.failure_step
    );
    println!("advisories raised:    {}", metrics.advisories_raised);
    println!("migrations completed: {}", metrics.migrations_completed);
    println!("migrations aborted:   {}", metrics.migrations_aborted);
    println!("failures preempted:   {}", metrics.failures_preempted);
    println!("cold escalations:     {}", metrics.cold_escalations);
    println!("invalid samples:      {}", metrics.invalid_samples);
    if let Some(stats) = engine.server_stats(doomed) {
        println!(
            "doomed server:        {} failure(s) observed, mtbf {:?} ms",
            stats.failures,
            stats.mtbf_ms()
        );
    }
    println!();
    println!(
        "proactive downtime:   {} ms (measured cutover + cold fallbacks)",
        proactive_ms
    );
    println!(
        "reactive baseline:    {} ms ({} affected service(s) x {} ms cold migration)",
        reactive_ms, affected_services, args.cold_migration_ms
    );
    if reactive_ms > 0 {
        let reduction = reactive_ms as f64 / proactive_ms.max(1) as f64;
        println!("downtime reduction:   {reduction:.0}x");
    }

    Ok(())
}
