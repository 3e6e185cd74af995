//! Run command: sample until interrupted and print snapshots.

use std::io::{self, Write};

use anyhow::{Context, Result};
use gamehud_core::config::Config;
use gamehud_core::{EngineState, MetricsSnapshot, scheduler};
use tokio::sync::watch;
use tracing::{info, warn};

pub struct RunOptions {
    pub interval_ms: Option<u64>,
    pub ticks: Option<u64>,
    pub json: bool,
}

/// Starts the engine and prints each snapshot to stdout.
///
/// Stops on Ctrl+C, after `ticks` snapshots, or when the engine exits.
pub async fn run(mut config: Config, options: RunOptions) -> Result<()> {
    if let Some(interval_ms) = options.interval_ms {
        config.interval_ms = interval_ms;
    }

    let (tx, mut rx) = watch::channel(None);
    let engine = scheduler::spawn(config, tx).context("start sampling engine")?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut printed = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                eprintln!("Stopping.");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(snapshot) = rx.borrow_and_update().clone() else {
                    continue;
                };
                print_snapshot(&snapshot, options.json)?;
                printed += 1;
                if options.ticks.is_some_and(|limit| printed >= limit) {
                    break;
                }
            }
        }
    }

    let state = tokio::task::spawn_blocking(move || {
        let mut engine = engine;
        engine.stop();
        engine.state()
    })
    .await
    .context("join sampling engine")?;
    if state != EngineState::Stopped {
        warn!(?state, "sampling engine did not shut down cleanly");
    }
    info!(snapshots = printed, "run finished");
    Ok(())
}

fn print_snapshot(snapshot: &MetricsSnapshot, json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    if json {
        let line = serde_json::to_string(snapshot).context("serialize snapshot")?;
        writeln!(out, "{line}")?;
    } else {
        for line in snapshot.overlay_lines() {
            writeln!(out, "{line}")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}
