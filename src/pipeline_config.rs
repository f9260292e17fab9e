//! Pool sizing derived from host resources.
//!
//! Maps a `HostResources` snapshot plus run settings to concrete worker and
//! writer counts, per-worker memory budgets and channel capacities. Pure
//! functions only; detection lives in `hardware.rs`.

use serde::Serialize;

use crate::config::Settings;
use crate::hardware::HostResources;

// ═══════════════════════════════════════════════════════════
// Constants: reserved capacity
// ═══════════════════════════════════════════════════════════

/// Cores held back for the progress supervisor.
const RESERVED_SUPERVISOR_CORES: usize = 1;
/// Cores held back for the job manager itself.
const RESERVED_MANAGER_CORES: usize = 1;
/// Cores left to the operating system.
const OS_HEADROOM_CORES: usize = 1;

/// In-memory footprint of a loaded document relative to its size on disk.
pub const DOCUMENT_MEMORY_FACTOR: u64 = 8;

const MB: u64 = 1024 * 1024;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Knobs of the per-worker memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryPolicy {
    /// Fraction of total RAM the run may use at all.
    pub safety_fraction: f64,
    /// Held back for the OS and unrelated processes (MiB).
    pub os_reserve_mb: u64,
    /// Held back per writer for SQLite page caches and batches (MiB).
    pub writer_reserve_mb: u64,
    /// Lower clamp (MiB).
    pub min_per_worker_mb: u64,
    /// Upper clamp (MiB).
    pub cap_per_worker_mb: u64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            safety_fraction: 0.85,
            os_reserve_mb: 2048,
            writer_reserve_mb: 256,
            min_per_worker_mb: 512,
            cap_per_worker_mb: 4096,
        }
    }
}

/// Concrete sizing of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerPlan {
    pub worker_count: usize,
    pub writer_count: usize,
    pub memory_per_worker_mb: u64,
    pub reserved_cores: usize,
    pub task_capacity: usize,
    pub event_capacity: usize,
    pub writer_capacity: usize,
}

impl WorkerPlan {
    pub fn memory_per_worker_bytes(&self) -> u64 {
        self.memory_per_worker_mb.saturating_mul(MB)
    }
}

// ═══════════════════════════════════════════════════════════
// Derivation
// ═══════════════════════════════════════════════════════════

/// Cores kept away from extraction workers.
pub fn reserved_cores(writer_pool_size: usize) -> usize {
    writer_pool_size + RESERVED_SUPERVISOR_CORES + RESERVED_MANAGER_CORES + OS_HEADROOM_CORES
}

/// Extraction worker count: cores minus reserved components, floor 1.
pub fn worker_count(host: &HostResources, writer_pool_size: usize) -> usize {
    host.total_cores
        .saturating_sub(reserved_cores(writer_pool_size))
        .max(1)
}

/// Per-worker memory budget in MiB, clamped to the policy bounds.
pub fn memory_budget_mb(
    host: &HostResources,
    worker_count: usize,
    writer_pool_size: usize,
    policy: &MemoryPolicy,
) -> u64 {
    let total_mb = (host.total_ram_bytes / MB) as f64;
    let usable = total_mb * policy.safety_fraction
        - policy.os_reserve_mb as f64
        - (policy.writer_reserve_mb * writer_pool_size as u64) as f64;
    let per_worker = if usable <= 0.0 {
        0
    } else {
        (usable / worker_count.max(1) as f64) as u64
    };
    let cap = policy.cap_per_worker_mb.max(policy.min_per_worker_mb);
    per_worker.clamp(policy.min_per_worker_mb, cap)
}

/// Build the run plan from host resources and settings.
///
/// `task_count` caps the worker count: there is no point in idle workers.
pub fn derive_plan(host: &HostResources, settings: &Settings, task_count: usize) -> WorkerPlan {
    let writer_count = settings.writer_pool_size.max(1);
    let computed = worker_count(host, writer_count);
    let requested = settings.workers.unwrap_or(computed).max(1);
    let workers = requested.min(task_count.max(1));

    let policy = MemoryPolicy {
        cap_per_worker_mb: settings.max_memory_per_worker_mb,
        ..MemoryPolicy::default()
    };
    let memory = memory_budget_mb(host, workers, writer_count, &policy);

    WorkerPlan {
        worker_count: workers,
        writer_count,
        memory_per_worker_mb: memory,
        reserved_cores: reserved_cores(writer_count),
        task_capacity: workers * 2,
        event_capacity: workers * 4 + 16,
        writer_capacity: workers * 2,
    }
}

/// Estimated bytes needed to hold a document of `size_bytes` in memory.
pub fn estimated_document_memory(size_bytes: u64) -> u64 {
    size_bytes.saturating_mul(DOCUMENT_MEMORY_FACTOR)
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
