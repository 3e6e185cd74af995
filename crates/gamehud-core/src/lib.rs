//! Telemetry engine behind the gamehud performance overlay.
//!
//! Samples CPU, memory, battery and the frame rate of the foreground game
//! once per interval and hands each [`snapshot::MetricsSnapshot`] to a sink.

pub mod config;
pub mod cpu;
pub mod frames;
pub mod layers;
pub mod logging;
pub mod memory;
pub mod power;
pub mod scheduler;
pub mod shell;
pub mod snapshot;

pub use config::Config;
pub use scheduler::{Engine, EngineHandle, EngineState};
pub use snapshot::{Fps, MetricsSnapshot, SnapshotSink};
