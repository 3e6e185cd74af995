//! Frame-timing sampler.
//!
//! Reduces a compositor latency dump to a frame count over the trailing
//! second. The dump starts with the refresh period (ns) and then holds one
//! `desired actual ready` triplet per recently presented frame; the second
//! column is the presentation timestamp on the monotonic clock.

use crate::config::CompositorConfig;
use crate::shell::{Shell, ShellError};

/// Timestamp the compositor writes for a frame that was never presented.
pub const NEVER_PRESENTED: i64 = i64::MAX;

const WINDOW_NS: i64 = 1_000_000_000;

/// Source of monotonic nanoseconds, comparable to compositor timestamps.
pub type MonotonicClock = fn() -> i64;

/// Reads `CLOCK_MONOTONIC`, the clock the compositor stamps frames with.
#[cfg(unix)]
pub fn monotonic_now_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) };
    if rc != 0 {
        return 0;
    }
    i64::from(ts.tv_sec) * 1_000_000_000 + i64::from(ts.tv_nsec)
}

#[cfg(not(unix))]
pub fn monotonic_now_ns() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START.get_or_init(Instant::now).elapsed();
    i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
}

/// Parsed result of one latency dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyReading {
    /// Frames presented in `(now - 1s, now]`.
    pub frames: u32,
    /// Refresh period from the header line, when it parsed to a positive value.
    pub refresh_period_ns: Option<i64>,
}

/// Counts presentation timestamps in the trailing one-second window.
///
/// The first line is the header. Lines that are blank, too short or not
/// numeric are skipped, as are never-presented frames.
pub fn parse_latency_dump<S: AsRef<str>>(lines: &[S], now_ns: i64) -> LatencyReading {
    let mut lines = lines.iter().map(AsRef::as_ref);
    let refresh_period_ns = lines
        .next()
        .and_then(|header| header.trim().parse::<i64>().ok())
        .filter(|period| *period > 0);

    let window_start = now_ns.saturating_sub(WINDOW_NS);
    let frames = lines
        .filter_map(presentation_timestamp)
        .filter(|&t| t != NEVER_PRESENTED && t > window_start && t <= now_ns)
        .count();

    LatencyReading {
        frames: u32::try_from(frames).unwrap_or(u32::MAX),
        refresh_period_ns,
    }
}

fn presentation_timestamp(line: &str) -> Option<i64> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Escapes a layer name for use inside a double-quoted shell word.
fn quote_layer(layer: &str) -> String {
    let mut out = String::with_capacity(layer.len());
    for c in layer.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Queries latency dumps through the shell and turns them into FPS values.
pub struct FrameSampler {
    latency_template: String,
    clock: MonotonicClock,
    refresh_period_ns: Option<i64>,
}

impl FrameSampler {
    pub fn new(compositor: &CompositorConfig) -> Self {
        Self {
            latency_template: compositor.latency_command.clone(),
            clock: monotonic_now_ns,
            refresh_period_ns: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn latency_command(&self, layer: &str) -> String {
        self.latency_template.replace("{layer}", &quote_layer(layer))
    }

    /// Frames `layer` presented during the last second.
    pub async fn sample<S: Shell>(&mut self, shell: &mut S, layer: &str) -> Result<u32, ShellError> {
        let lines = shell.execute(&self.latency_command(layer)).await?;
        let reading = parse_latency_dump(&lines, (self.clock)());
        if reading.refresh_period_ns.is_some() {
            self.refresh_period_ns = reading.refresh_period_ns;
        }
        Ok(reading.frames)
    }

    /// Display refresh rate derived from the last header seen.
    pub fn refresh_rate_hz(&self) -> Option<f32> {
        self.refresh_period_ns
            .map(|period| (1_000_000_000.0 / period as f64) as f32)
    }
}
