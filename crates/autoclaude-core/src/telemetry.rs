//! Resource telemetry.
//!
//! Disk and memory probes used by the recovery loop's resource-pressure
//! checks and the metrics gauges. Memory figures come from
//! `/proc/meminfo`, with a degrade-to-unknown fallback on platforms
//! without it.

use std::path::Path;

/// A point-in-time resource snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    /// Free bytes on the filesystem holding the base directory.
    pub disk_free_bytes: u64,

    /// Memory in use, percent; `None` when the probe is unavailable.
    pub memory_used_percent: Option<f64>,
}

impl ResourceSnapshot {
    /// Free disk space in whole gigabytes.
    #[must_use]
    pub const fn disk_free_gb(&self) -> u64 {
        self.disk_free_bytes / (1024 * 1024 * 1024)
    }
}

/// Probe free disk space for the filesystem containing `path`.
///
/// # Errors
///
/// Returns an error if the statvfs call fails.
pub fn disk_free_bytes(path: &Path) -> std::io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    // Available blocks for unprivileged users, not total free blocks.
    let free = u64::from(stat.blocks_available()) * u64::from(stat.fragment_size());
    Ok(free)
}

/// Probe system memory usage from `/proc/meminfo`.
#[must_use]
pub fn memory_used_percent() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb: Option<f64> = None;
    let mut available_kb: Option<f64> = None;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_meminfo_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_meminfo_kb(rest);
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }
    let total = total_kb?;
    let available = available_kb?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total) * 100.0)
}

fn parse_meminfo_kb(rest: &str) -> Option<f64> {
    rest.trim()
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
}

/// Take a full snapshot relative to `base_dir`.
///
/// # Errors
///
/// Returns an error if the disk probe fails.
pub fn snapshot(base_dir: &Path) -> std::io::Result<ResourceSnapshot> {
    Ok(ResourceSnapshot {
        disk_free_bytes: disk_free_bytes(base_dir)?,
        memory_used_percent: memory_used_percent(),
    })
}
