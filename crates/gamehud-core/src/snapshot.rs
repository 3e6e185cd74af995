//! Per-tick metrics snapshot and the display hand-off.

use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;

/// Frame rate of the tracked layer.
///
/// `Measured(0)` is a real reading (the game is frozen); `Unavailable` means
/// there was nothing to measure. Serializes as a number or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Fps {
    Measured(u32),
    Unavailable,
}

impl Fps {
    pub fn value(self) -> Option<u32> {
        match self {
            Fps::Measured(fps) => Some(fps),
            Fps::Unavailable => None,
        }
    }
}

impl fmt::Display for Fps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(fps) => write!(f, "{fps}"),
            None => f.write_str("--"),
        }
    }
}

/// Everything one tick measured. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub watts: f64,
    pub temperature_c: f32,
    pub cpu_percent: u32,
    pub mem_percent: u32,
    pub fps: Fps,
    pub refresh_rate_hz: f32,
    pub captured_at: DateTime<Local>,
}

impl MetricsSnapshot {
    /// The overlay readout, one line per widget row.
    pub fn overlay_lines(&self) -> [String; 5] {
        [
            format!("PWR: {:.1} W", self.watts),
            format!("CPU: {}%", self.cpu_percent),
            format!("RAM: {}%", self.mem_percent),
            format!("TMP: {:.1} C", self.temperature_c),
            format!("{} FPS / {:.0} Hz", self.fps, self.refresh_rate_hz),
        ]
    }
}

/// Receiver of finished snapshots (the overlay widget).
///
/// Posting is fire-and-forget: implementations must not block the sampler.
pub trait SnapshotSink: Send {
    fn post(&self, snapshot: MetricsSnapshot);
}

/// Latest-value hand-off: a slow reader only ever sees the newest snapshot.
impl SnapshotSink for watch::Sender<Option<MetricsSnapshot>> {
    fn post(&self, snapshot: MetricsSnapshot) {
        self.send_replace(Some(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(fps: Fps) -> MetricsSnapshot {
        MetricsSnapshot {
            watts: 1.9,
            temperature_c: 31.2,
            cpu_percent: 50,
            mem_percent: 75,
            fps,
            refresh_rate_hz: 60.0,
            captured_at: Local::now(),
        }
    }

    #[test]
    fn test_overlay_lines() {
        let lines = snapshot(Fps::Measured(58)).overlay_lines();
        assert_eq!(
            lines,
            [
                "PWR: 1.9 W".to_string(),
                "CPU: 50%".to_string(),
                "RAM: 75%".to_string(),
                "TMP: 31.2 C".to_string(),
                "58 FPS / 60 Hz".to_string(),
            ]
        );
        assert_eq!(snapshot(Fps::Unavailable).overlay_lines()[4], "-- FPS / 60 Hz");
    }

    #[test]
    fn test_fps_value() {
        assert_eq!(Fps::Measured(0).value(), Some(0));
        assert_eq!(Fps::Unavailable.value(), None);
    }

    #[test]
    fn test_fps_serializes_as_number_or_null() {
        let measured = serde_json::to_value(snapshot(Fps::Measured(0))).unwrap();
        assert_eq!(measured["fps"], 0);

        let unavailable = serde_json::to_value(snapshot(Fps::Unavailable)).unwrap();
        assert!(unavailable["fps"].is_null());
        assert_eq!(unavailable["cpu_percent"], 50);
    }

    #[test]
    fn test_watch_sink_keeps_latest() {
        let (tx, rx) = watch::channel(None);
        tx.post(snapshot(Fps::Measured(1)));
        tx.post(snapshot(Fps::Measured(2)));

        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.fps, Fps::Measured(2));
    }
}
