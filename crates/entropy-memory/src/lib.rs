//! Memory governor.
//!
//! Bounds peak memory under unexpected input surges or downstream stalls by
//! periodically inspecting this process's resident set size against the
//! total system memory and escalating through normal/warning/critical.

use sysinfo::{Pid, System};
use tracing::{error, warn};

/// Classification of the current memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Normal,
    Warning,
    Critical,
}

/// One memory-governor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub rss_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub status: MemoryStatus,
}

/// Periodically-polled memory watchdog for the current process.
pub struct MemoryGovernor {
    system: System,
    pid: Pid,
    threshold_percent: f64,
    critical_percent: f64,
}

impl MemoryGovernor {
    pub fn new(threshold_percent: f64, critical_percent: f64) -> Self {
        MemoryGovernor {
            system: System::new_all(),
            pid: Pid::from_u32(std::process::id()),
            threshold_percent,
            critical_percent,
        }
    }

    /// Refresh and classify current memory usage. Forces an allocator
    /// reclamation hint at `warning` and `critical`; the caller is
    /// responsible for discarding the Mixer's in-flight batch at
    /// `critical` (see `entropy-mixer::Mixer::clear`).
    pub fn check_memory(&mut self) -> MemoryStats {
        self.system.refresh_all();

        let rss_bytes = self
            .system
            .process(self.pid)
            .map(sysinfo::Process::memory)
            .unwrap_or(0);
        let total_bytes = self.system.total_memory().max(1);
        let percent = rss_bytes as f64 / total_bytes as f64 * 100.0;

        let status = if percent >= self.critical_percent {
            error!(percent, "memory use critical");
            force_reclaim_hint();
            MemoryStatus::Critical
        } else if percent >= self.threshold_percent {
            warn!(percent, "memory use high");
            force_reclaim_hint();
            MemoryStatus::Warning
        } else {
            MemoryStatus::Normal
        };

        MemoryStats {
            rss_bytes,
            total_bytes,
            percent,
            status,
        }
    }
}

/// Defensive-reclamation hint. Rust has no global collector to trigger;
/// this is the documented seam for an allocator-specific hint (e.g.
/// `jemalloc`'s epoch advance) should one be adopted later.
fn force_reclaim_hint() {
    tracing::debug!("forced allocator reclamation hint");
}
