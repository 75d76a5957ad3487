//! Watch command implementation
//!
//! Starts every configured server and prints status changes and statistics
//! until interrupted. Also notices when the machine resumed from sleep and
//! tells the orchestrator, so lost sessions are retried at once.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use vg_core::{ConnectionStatus, ServerId};
use vg_orchestrator::{Orchestrator, OrchestratorEvent};

use super::user_error;
use crate::context::AppContext;
use crate::output::{format_snapshot, print_info, print_status, print_success, print_warning};

/// How often the sleep detector samples the clocks
const WAKE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Wall-clock time unaccounted for by the monotonic clock that counts as sleep
const WAKE_GAP: Duration = Duration::from_secs(10);

/// Watch every configured server, or only the one matching `filter`
pub async fn watch_command(ctx: &AppContext, filter: Option<&str>, stats: bool) -> Result<()> {
    let only = match filter {
        Some(query) => Some(ctx.resolve_server(query)?.id),
        None => None,
    };

    let orchestrator = ctx.orchestrator();
    let mut events = orchestrator.subscribe();
    let started = orchestrator.load_persisted().map_err(user_error)?;
    if started == 0 {
        print_warning("No servers configured; add one with 'vigil add <host>'");
        return Ok(());
    }

    let names: HashMap<ServerId, String> = orchestrator
        .servers()
        .into_iter()
        .map(|s| (s.identity.id, s.identity.name))
        .collect();
    print_info(&format!(
        "Watching {} server(s), press Ctrl+C to stop",
        started
    ));

    let cancel = CancellationToken::new();
    let detector = tokio::spawn(detect_wake(orchestrator.clone(), cancel.clone()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&names, only.as_ref(), &event, stats),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Display fell behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    cancel.cancel();
    let _ = detector.await;
    orchestrator.stop_all().await;
    Ok(())
}

fn print_event(
    names: &HashMap<ServerId, String>,
    only: Option<&ServerId>,
    event: &OrchestratorEvent,
    stats: bool,
) {
    let server_id = match event {
        OrchestratorEvent::StatusChanged { server_id, .. }
        | OrchestratorEvent::Stats { server_id, .. }
        | OrchestratorEvent::KeyInstalled { server_id }
        | OrchestratorEvent::KeyInstallFailed { server_id, .. } => server_id,
    };
    if only.is_some_and(|id| id != server_id) {
        return;
    }
    let name = names
        .get(server_id)
        .map(String::as_str)
        .unwrap_or_else(|| server_id.as_str());

    match event {
        OrchestratorEvent::StatusChanged { status, .. } => {
            print_status(name, *status);
            if *status == ConnectionStatus::AuthFailed {
                print_warning(&format!(
                    "{} rejected the stored credentials; run 'vigil login {}'",
                    name, server_id
                ));
            }
        }
        OrchestratorEvent::Stats { snapshot, .. } if stats => {
            println!("{:<20} {}", name, format_snapshot(snapshot));
        }
        OrchestratorEvent::Stats { .. } => {}
        OrchestratorEvent::KeyInstalled { .. } => {
            print_success(&format!("Installed a client key on {}", name));
        }
        OrchestratorEvent::KeyInstallFailed { error, .. } => {
            print_warning(&format!("Could not install a client key on {}: {}", name, error));
        }
    }
}

/// Report a system wake to the orchestrator.
///
/// The monotonic clock stops while the machine sleeps and the wall clock
/// does not, so a wall-clock jump between two samples means a resume.
async fn detect_wake(orchestrator: Orchestrator, cancel: CancellationToken) {
    let mut last_wall = SystemTime::now();
    let mut last_mono = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(WAKE_CHECK_INTERVAL) => {}
        }
        let wall = SystemTime::now();
        let mono = Instant::now();
        let wall_elapsed = wall.duration_since(last_wall).unwrap_or_default();
        if slept_through(wall_elapsed, mono.duration_since(last_mono)) {
            tracing::info!("System wake detected, retrying lost sessions");
            orchestrator.handle_wake();
        }
        last_wall = wall;
        last_mono = mono;
    }
}

fn slept_through(wall_elapsed: Duration, mono_elapsed: Duration) -> bool {
    wall_elapsed.saturating_sub(mono_elapsed) > WAKE_GAP
}
