//! CPU utilization estimated from frequency scaling.
//!
//! Each core's current clock is placed between its hardware minimum and
//! maximum. Frequency tracks load only loosely, so this is an estimate.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

/// Cached hardware frequency bounds of one core, in kHz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreFrequencyState {
    pub min_khz: u64,
    pub max_khz: u64,
}

impl CoreFrequencyState {
    fn is_known(self) -> bool {
        self.min_khz > 0 && self.max_khz > 0
    }

    fn has_range(self) -> bool {
        self.max_khz > self.min_khz
    }
}

/// Position of `cur` within `[min, max]` as a percentage.
///
/// Returns 0 when the range is empty or inverted.
pub fn core_utilization(min_khz: u64, max_khz: u64, cur_khz: u64) -> u32 {
    if max_khz <= min_khz {
        return 0;
    }
    let above_min = cur_khz.saturating_sub(min_khz).min(max_khz - min_khz);
    let percent = u128::from(above_min) * 100 / u128::from(max_khz - min_khz);
    u32::try_from(percent).unwrap_or(100)
}

struct Core {
    dir: PathBuf,
    bounds: CoreFrequencyState,
}

impl Core {
    fn refresh_bounds(&mut self) {
        self.bounds = CoreFrequencyState {
            min_khz: read_khz(&self.dir.join("cpufreq/cpuinfo_min_freq")),
            max_khz: read_khz(&self.dir.join("cpufreq/cpuinfo_max_freq")),
        };
    }
}

/// Reads a kHz counter, treating anything unreadable as zero.
fn read_khz(path: &Path) -> u64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Aggregates per-core frequency utilization under a cpu sysfs root.
pub struct CpuEstimator {
    root: PathBuf,
    cores: Vec<Core>,
}

impl CpuEstimator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cores: Vec::new(),
        }
    }

    /// Number of logical cores discovered so far.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Cached bounds, in discovery order.
    pub fn bounds(&self) -> Vec<CoreFrequencyState> {
        self.cores.iter().map(|core| core.bounds).collect()
    }

    fn discover(&mut self) -> Result<()> {
        let pattern = Regex::new(r"^cpu[0-9]+$").context("Failed to compile core pattern")?;
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?;

        let mut found: Vec<(u32, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                if !pattern.is_match(&name) {
                    return None;
                }
                let index = name.trim_start_matches("cpu").parse().ok()?;
                Some((index, entry.path()))
            })
            .collect();
        found.sort_by_key(|(index, _)| *index);

        self.cores = found
            .into_iter()
            .map(|(_, dir)| {
                let mut core = Core {
                    dir,
                    bounds: CoreFrequencyState::default(),
                };
                core.refresh_bounds();
                core
            })
            .collect();
        debug!(cores = self.cores.len(), root = %self.root.display(), "discovered cpu cores");
        Ok(())
    }

    /// Mean utilization over cores with a usable frequency range.
    ///
    /// Errors only when the cpu root cannot be listed; unreadable per-core
    /// files count as zero.
    pub fn sample(&mut self) -> Result<u32> {
        if self.cores.is_empty() {
            self.discover()?;
        }

        let mut total = 0u64;
        let mut counted = 0u64;
        for core in &mut self.cores {
            if !core.bounds.is_known() {
                core.refresh_bounds();
            }
            if !core.bounds.has_range() {
                continue;
            }
            let cur = read_khz(&core.dir.join("cpufreq/scaling_cur_freq"));
            total += u64::from(core_utilization(core.bounds.min_khz, core.bounds.max_khz, cur));
            counted += 1;
        }

        if counted == 0 {
            return Ok(0);
        }
        Ok(u32::try_from(total / counted).unwrap_or(100))
    }
}
