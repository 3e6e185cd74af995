//! Sampling scheduler.
//!
//! One background thread owns every sampler and the shell. Each tick reads the
//! cheap kernel sources first, then the shell-backed frame counter, builds a
//! [`MetricsSnapshot`] and posts it. Cancellation is only observed between
//! ticks, while the loop sleeps.

use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::Local;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cpu::CpuEstimator;
use crate::frames::FrameSampler;
use crate::layers::LayerDetector;
use crate::memory::MemorySampler;
use crate::power::{BatterySource, BatteryStatus, SysfsBattery};
use crate::shell::{Shell, ShellChannel};
use crate::snapshot::{Fps, MetricsSnapshot, SnapshotSink};

const THREAD_NAME: &str = "gamehud-sampler";

/// Lifecycle of the sampling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    /// Opening the shell; no snapshot posted yet.
    Initializing,
    Sampling,
}

/// Warns on the first failure of a source, then stays quiet until it recovers.
#[derive(Debug, Default)]
struct FaultLog {
    failing: bool,
}

impl FaultLog {
    fn failed(&mut self, source: &str, err: &dyn Display) {
        if self.failing {
            debug!(source, %err, "metric source still failing");
        } else {
            warn!(source, %err, "metric source failed, reporting zero");
            self.failing = true;
        }
    }

    fn recovered(&mut self, source: &str) {
        if self.failing {
            info!(source, "metric source recovered");
            self.failing = false;
        }
    }

    fn observe<T: Default>(&mut self, source: &str, result: Result<T>) -> T {
        match result {
            Ok(value) => {
                self.recovered(source);
                value
            }
            Err(err) => {
                self.failed(source, &format_args!("{err:#}"));
                T::default()
            }
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    cpu: FaultLog,
    power: FaultLog,
    memory: FaultLog,
}

/// Every sampler plus the shell they share.
pub struct Engine {
    config: Config,
    shell: ShellChannel,
    detector: LayerDetector,
    frames: FrameSampler,
    cpu: CpuEstimator,
    battery: Box<dyn BatterySource>,
    memory: MemorySampler,
    faults: Faults,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            shell: ShellChannel::new(config.shell.clone()),
            detector: LayerDetector::from_config(&config.layers, &config.compositor),
            frames: FrameSampler::new(&config.compositor),
            cpu: CpuEstimator::new(&config.sources.cpu_root),
            battery: Box::new(SysfsBattery::new(&config.sources.power_supply_dir)),
            memory: MemorySampler::new(&config.sources.meminfo_path),
            faults: Faults::default(),
            config,
        }
    }

    #[must_use]
    pub fn with_battery(mut self, battery: Box<dyn BatterySource>) -> Self {
        self.battery = battery;
        self
    }

    pub fn shell(&self) -> &ShellChannel {
        &self.shell
    }

    pub fn detector(&self) -> &LayerDetector {
        &self.detector
    }

    /// Opens the shell. Failure only disables frame metrics.
    pub async fn start(&mut self) -> bool {
        self.shell.open().await
    }

    /// Gathers one snapshot. Source failures read as zero for this tick.
    pub async fn tick(&mut self) -> MetricsSnapshot {
        let cpu_percent = self.faults.cpu.observe("cpu", self.cpu.sample());
        let battery = match self.battery.read() {
            Ok(status) => {
                self.faults.power.recovered("battery");
                Some(status)
            }
            Err(err) => {
                self.faults.power.failed("battery", &format_args!("{err:#}"));
                None
            }
        };
        let mem_percent = self.faults.memory.observe("memory", self.memory.sample());

        let fps = if self.shell.ensure_open().await {
            self.detector.poll(&mut self.shell, &mut self.frames).await
        } else {
            self.detector.forget();
            Fps::Unavailable
        };

        MetricsSnapshot {
            watts: battery.as_ref().map_or(0.0, BatteryStatus::watts),
            temperature_c: battery.as_ref().map_or(0.0, BatteryStatus::temperature_c),
            cpu_percent,
            mem_percent,
            fps,
            refresh_rate_hz: self
                .frames
                .refresh_rate_hz()
                .unwrap_or(self.config.refresh_rate_hz),
            captured_at: Local::now(),
        }
    }

    /// Closes the shell. Never fails.
    pub async fn shutdown(&mut self) {
        self.shell.close().await;
    }
}

/// Control handle for a running engine thread.
///
/// Dropping the handle stops the engine.
pub struct EngineHandle {
    cancel: CancellationToken,
    state: watch::Receiver<EngineState>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Cancels the pending sleep, lets the current tick finish, closes the
    /// shell and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("sampler thread panicked during shutdown");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts sampling with the default sources for `config`.
pub fn spawn<K: SnapshotSink + 'static>(config: Config, sink: K) -> Result<EngineHandle> {
    spawn_engine(Engine::new(config), sink)
}

/// Runs `engine` on its own thread, posting every snapshot to `sink`.
pub fn spawn_engine<K: SnapshotSink + 'static>(engine: Engine, sink: K) -> Result<EngineHandle> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build sampler runtime")?;

    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(EngineState::Stopped);

    let thread_cancel = cancel.clone();
    let thread = std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            runtime.block_on(run(engine, sink, state_tx, thread_cancel));
        })
        .context("Failed to spawn sampler thread")?;

    Ok(EngineHandle {
        cancel,
        state: state_rx,
        thread: Some(thread),
    })
}

async fn run<K: SnapshotSink>(
    mut engine: Engine,
    sink: K,
    state: watch::Sender<EngineState>,
    cancel: CancellationToken,
) {
    state.send_replace(EngineState::Initializing);
    info!("engine initializing");
    engine.start().await;

    let interval = engine.config.interval();
    state.send_replace(EngineState::Sampling);
    info!(?interval, "engine sampling");

    while !cancel.is_cancelled() {
        match AssertUnwindSafe(engine.tick()).catch_unwind().await {
            Ok(snapshot) => sink.post(snapshot),
            Err(_panic) => warn!("sampling tick panicked, continuing"),
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }

    engine.shutdown().await;
    state.send_replace(EngineState::Stopped);
    info!("engine stopped");
}
