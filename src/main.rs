use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loadsim::lifecycle::SHUTDOWN_GRACE;
use loadsim::server::{self, AppState};
use loadsim::{Cli, Config, LifecycleTimer, LoadController, Termination, TerminationKind};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli).context("invalid configuration")?;
    info!(
        environment = %config.environment,
        port = config.port,
        crash_enabled = config.crash.enabled,
        crash_after_ms = config.crash.after_ms,
        shutdown_enabled = config.shutdown.enabled,
        shutdown_after_ms = config.shutdown.after_ms,
        dynamic_load_max = config.ramp.max_cpu_load,
        dynamic_load_step = config.ramp.increment_step,
        cpu_workers = config.cpu_workers,
        drain_policy = ?config.drain,
        memory_cap_mb = ?config.memory_cap_mb,
        "application configuration loaded"
    );

    let (lifecycle, mut terminations) = LifecycleTimer::new(config.crash, config.shutdown);
    let ctrl = LoadController::new(config.settings, config.ramp, config.engine())
        .with_lifecycle(lifecycle.clone());
    info!(
        cpu_load_percent = config.settings.cpu_load_percent,
        memory_mb = config.settings.memory_mb,
        duration_sec = config.settings.duration_sec,
        "load settings initialized"
    );

    // Zero-delay timers fire inside `arm`, before anything is bound.
    lifecycle.arm();
    if let Ok(termination) = terminations.try_recv() {
        if termination.kind == TerminationKind::Crash {
            crash(&termination);
        }
        info!(reason = %termination.reason, "exiting before the server started");
        std::process::exit(0);
    }

    let state = AppState {
        ctrl: ctrl.clone(),
        lifecycle,
        config: Arc::new(config),
    };
    let server = server::build_server(state).context("failed to bind listener")?;
    let handle = server.handle();

    tokio::select! {
        result = server => {
            result.context("server error")?;
            info!("server stopped");
            ctrl.halt().await;
        }
        Some(termination) = terminations.recv() => {
            if termination.kind == TerminationKind::Crash {
                crash(&termination);
            }
            info!(reason = %termination.reason, "shutting down server");
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.stop(true)).await.is_err() {
                warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "server did not drain in time");
            }
            ctrl.halt().await;
            info!("server exited successfully");
            std::process::exit(0);
        }
    }
    Ok(())
}

fn crash(termination: &Termination) -> ! {
    error!(reason = %termination.reason, "simulated crash, aborting");
    std::process::abort()
}
