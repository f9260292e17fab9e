//! Host resource detection.
//!
//! The only place that asks the operating system about cores and memory.
//! Planning logic in `pipeline_config` takes a `HostResources` value as an
//! argument, so it stays pure and testable.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Fallback RAM when system detection fails (8 GB, conservative).
const DEFAULT_RAM_FALLBACK: u64 = 8 * 1024 * 1024 * 1024;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Snapshot of the machine the batch runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResources {
    /// Logical cores available to the process.
    pub total_cores: usize,
    /// Total physical memory in bytes.
    pub total_ram_bytes: u64,
    /// ISO 8601 timestamp when detection occurred.
    pub detected_at: String,
}

impl HostResources {
    pub fn new(total_cores: usize, total_ram_bytes: u64) -> Self {
        Self {
            total_cores,
            total_ram_bytes,
            detected_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn total_ram_mb(&self) -> u64 {
        self.total_ram_bytes / (1024 * 1024)
    }
}

/// Detect cores and memory of the current host.
///
/// Falls back to a conservative RAM figure if the OS reports zero.
pub fn detect_host_resources() -> HostResources {
    let _span = tracing::info_span!("hardware_detect").entered();

    let cores = num_cpus::get().max(1);
    let mut sys = System::new();
    sys.refresh_memory();
    let ram = match sys.total_memory() {
        0 => {
            tracing::warn!("Memory detection returned 0, assuming 8 GB");
            DEFAULT_RAM_FALLBACK
        }
        bytes => bytes,
    };

    let resources = HostResources::new(cores, ram);
    tracing::info!(
        cores = resources.total_cores,
        ram_mb = resources.total_ram_mb(),
        "Host resources detected"
    );
    resources
}

/// Samples the resident set size of this process.
///
/// Holds its own `System` so repeated samples reuse allocations. One sampler
/// per worker thread; never shared.
pub struct RssSampler {
    sys: System,
    pid: Option<sysinfo::Pid>,
}

impl RssSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Current RSS in MiB, or `None` when the platform does not report it.
    pub fn sample_mb(&mut self) -> Option<f64> {
        let pid = self.pid?;
        if !self.sys.refresh_process(pid) {
            return None;
        }
        self.sys
            .process(pid)
            .map(|p| p.memory() as f64 / BYTES_PER_MB)
    }
}

impl Default for RssSampler {
    fn default() -> Self {
        Self::new()
    }
}
