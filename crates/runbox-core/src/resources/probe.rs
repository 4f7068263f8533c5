//! Host telemetry sources for the resource controller.

use std::sync::Mutex;
use sysinfo::System;

/// Point-in-time view of host memory and CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSample {
    /// Bytes.
    pub total_memory: u64,
    /// Bytes available for new allocations.
    pub free_memory: u64,
    /// Logical CPUs.
    pub cpus: usize,
}

pub trait HostProbe: Send + Sync {
    fn sample(&self) -> HostSample;
}

/// Reads the local host through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    cpus: usize,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        let cpus = system.cpus().len().max(1);
        Self {
            system: Mutex::new(system),
            cpus,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self) -> HostSample {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        HostSample {
            total_memory: system.total_memory(),
            free_memory: system.available_memory(),
            cpus: self.cpus,
        }
    }
}

/// Probe that reports whatever it was last told. Handy for tests and for
/// pinning capacity on hosts where telemetry is misleading.
pub struct FixedProbe {
    sample: Mutex<HostSample>,
}

impl FixedProbe {
    pub fn new(sample: HostSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: HostSample) {
        *self.sample.lock().unwrap_or_else(|e| e.into_inner()) = sample;
    }
}

impl HostProbe for FixedProbe {
    fn sample(&self) -> HostSample {
        *self.sample.lock().unwrap_or_else(|e| e.into_inner())
    }
}
