//! Memory utilization from `/proc/meminfo`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

fn field_kb(line: &str, key: &str) -> Option<u64> {
    line.strip_prefix(key)?
        .strip_prefix(':')?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Percentage of memory in use: `(total - available) * 100 / total`.
///
/// Kernels without `MemAvailable` fall back to `MemFree`.
pub fn parse_meminfo(contents: &str) -> Result<u32> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in contents.lines() {
        if let Some(v) = field_kb(line, "MemTotal") {
            total = Some(v);
        } else if let Some(v) = field_kb(line, "MemAvailable") {
            available = Some(v);
        } else if let Some(v) = field_kb(line, "MemFree") {
            free = Some(v);
        }
    }

    let Some(total) = total.filter(|t| *t > 0) else {
        bail!("MemTotal missing from meminfo");
    };
    let Some(available) = available.or(free) else {
        bail!("MemAvailable and MemFree missing from meminfo");
    };

    let used = total.saturating_sub(available);
    Ok(u32::try_from(used * 100 / total).unwrap_or(100))
}

pub struct MemorySampler {
    path: PathBuf,
}

impl MemorySampler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn sample(&self) -> Result<u32> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        parse_meminfo(&contents).with_context(|| format!("Failed to parse {}", self.path.display()))
    }
}
