use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cadence_core::{listener, EventKind, EventSource, ExecutionContext, TimerTrigger};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{load_config, validate};
use crate::jobs::build_orchestrator;

/// How long triggers get to acknowledge cancellation on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long in-flight job executions get to finish once triggers stopped
const JOB_GRACE: Duration = Duration::from_secs(30);

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    validate(&config)?;

    let (orchestrator, triggers) = build_orchestrator(&config)?;

    // Wake the main loop whenever a trigger stops
    let stopped = Arc::new(Notify::new());
    let notify = Arc::clone(&stopped);
    orchestrator.subscribe(listener(move |event| {
        if matches!(event.source, EventSource::Trigger(_))
            && matches!(event.kind, EventKind::Canceled | EventKind::Completed)
        {
            notify.notify_one();
        }
        Ok(())
    }));

    let mut events = orchestrator.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "Scheduler event"),
                    Err(e) => warn!(error = %e, "Failed to serialize scheduler event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let context = ExecutionContext::builder()
        .insert("pid", std::process::id())
        .build();
    let shutdown = CancellationToken::new();
    orchestrator.start(Some(context), shutdown.clone())?;
    info!(
        "Cadence v{} running {} triggers and {} jobs",
        env!("CARGO_PKG_VERSION"),
        config.triggers.len(),
        config.jobs.len()
    );

    tokio::select! {
        _ = wait_all_stopped(&triggers, &stopped) => {
            info!("Every trigger has stopped");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, shutting down");
            shutdown.cancel();
            if tokio::time::timeout(SHUTDOWN_GRACE, wait_all_stopped(&triggers, &stopped))
                .await
                .is_err()
            {
                warn!("Triggers did not stop within {:?}", SHUTDOWN_GRACE);
            }
        }
    }

    let running = orchestrator.running_jobs();
    if running > 0 {
        info!(running, "Waiting for in-flight jobs");
        if tokio::time::timeout(JOB_GRACE, orchestrator.wait_idle())
            .await
            .is_err()
        {
            warn!(
                running = orchestrator.running_jobs(),
                "Jobs still running after {:?}, abandoning them", JOB_GRACE
            );
        }
    }

    let stats = orchestrator.stats();
    info!(
        triggered = stats.triggered,
        faulted = stats.faulted,
        canceled = stats.canceled,
        completed = stats.completed,
        "Scheduler stopped"
    );
    Ok(())
}

async fn wait_all_stopped(triggers: &[Arc<TimerTrigger>], stopped: &Notify) {
    while !triggers.iter().all(|t| t.state().is_terminal()) {
        stopped.notified().await;
    }
}
