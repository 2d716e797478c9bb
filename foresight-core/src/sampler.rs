//! System metrics collaborator
//!
//! The pipeline only needs plain numeric readings. [`SysinfoSource`] reads
//! them from the OS; [`FixedSource`] replays canned values.

use crate::error::{Error, Result};
use crate::types::SystemMetric;
use std::collections::VecDeque;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};

/// Anything that can produce a current [`SystemMetric`]
pub trait MetricsSource: Send {
    fn sample(&mut self) -> Result<SystemMetric>;
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Metrics read through `sysinfo`
pub struct SysinfoSource {
    system: System,
    disks: Disks,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    /// Blocks for at least [`MINIMUM_CPU_UPDATE_INTERVAL`] so CPU usage is meaningful.
    fn sample(&mut self) -> Result<SystemMetric> {
        self.system.refresh_cpu();
        std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_processes();
        self.disks.refresh();

        let total_memory = self.system.total_memory();
        if total_memory == 0 {
            return Err(Error::Sampler("total memory reported as zero".to_string()));
        }

        let cpu = self.system.global_cpu_info().cpu_usage() as f64;
        let disk = self
            .disks
            .iter()
            .next()
            .map(|disk| {
                let total = disk.total_space();
                percent(total.saturating_sub(disk.available_space()), total)
            })
            .unwrap_or(0.0);

        Ok(SystemMetric::new(
            if cpu.is_finite() { cpu.clamp(0.0, 100.0) } else { 0.0 },
            percent(self.system.used_memory(), total_memory),
            disk,
            self.system.processes().len().min(u32::MAX as usize) as u32,
        ))
    }
}

/// Replays a fixed list of readings, then repeats the last one
#[derive(Debug, Clone)]
pub struct FixedSource {
    readings: VecDeque<(f64, f64, f64, u32)>,
    last: Option<(f64, f64, f64, u32)>,
}

impl FixedSource {
    /// Readings are `(cpu, memory, disk, processes)`.
    pub fn new(readings: impl IntoIterator<Item = (f64, f64, f64, u32)>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            last: None,
        }
    }
}

impl MetricsSource for FixedSource {
    fn sample(&mut self) -> Result<SystemMetric> {
        if let Some(next) = self.readings.pop_front() {
            self.last = Some(next);
        }
        let (cpu, memory, disk, processes) = self
            .last
            .ok_or_else(|| Error::Sampler("no readings configured".to_string()))?;
        Ok(SystemMetric::new(cpu, memory, disk, processes))
    }
}
