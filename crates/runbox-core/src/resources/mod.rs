//! Adaptive admission control.
//!
//! The [`ResourceController`] turns host telemetry into a container capacity
//! and answers whether one more attempt may start. Sampling is refreshed on a
//! time cadence and after a fixed number of admission checks rather than on
//! every request. Admission is a best-effort throttle: the check and the
//! subsequent [`ResourceController::acquire`] are not atomic.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ResourcesConfig;

pub mod probe;

pub use probe::{FixedProbe, HostProbe, HostSample, SysinfoProbe};

/// Share of total memory held back for the host, before the floor applies.
const RESERVED_MEMORY_RATIO: f64 = 0.2;
/// Free memory must exceed the per-container estimate by this factor.
const FREE_MEMORY_HEADROOM: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub total_memory: u64,
    pub free_memory: u64,
    pub cpus: usize,
    pub memory_capacity: usize,
    pub cpu_capacity: usize,
    pub capacity: usize,
}

impl ResourceSnapshot {
    fn compute(sample: HostSample, config: &ResourcesConfig) -> Self {
        let reserved = ((sample.total_memory as f64 * RESERVED_MEMORY_RATIO) as u64)
            .min(config.reserved_memory_floor);
        let memory_capacity = (sample.total_memory.saturating_sub(reserved)
            / config.per_container_memory_estimate.max(1)) as usize;
        let cpu_capacity =
            ((sample.cpus as f64 * config.cpu_utilization_target).floor() as usize).max(1);
        let capacity = config
            .max_containers
            .min(memory_capacity)
            .min(cpu_capacity)
            .max(1);

        Self {
            total_memory: sample.total_memory,
            free_memory: sample.free_memory,
            cpus: sample.cpus,
            memory_capacity,
            cpu_capacity,
            capacity,
        }
    }
}

struct SampleState {
    snapshot: ResourceSnapshot,
    sampled_at: Instant,
    checks_since_sample: u32,
}

#[derive(Default)]
struct SlotCounters {
    active: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// One admitted attempt's claim on a container slot. Dropping it releases the
/// slot; there is no other way to release.
pub struct SlotGuard {
    counters: Arc<SlotCounters>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ResourceController {
    config: ResourcesConfig,
    probe: Arc<dyn HostProbe>,
    state: Mutex<SampleState>,
    counters: Arc<SlotCounters>,
}

impl ResourceController {
    pub fn new(config: ResourcesConfig, probe: Arc<dyn HostProbe>) -> Self {
        let snapshot = ResourceSnapshot::compute(probe.sample(), &config);
        log::info!(
            "Initial capacity {} (memory {}, cpu {}, max {}) on host with {} CPUs and {} MiB",
            snapshot.capacity,
            snapshot.memory_capacity,
            snapshot.cpu_capacity,
            config.max_containers,
            snapshot.cpus,
            snapshot.total_memory / (1024 * 1024)
        );
        Self {
            config,
            probe,
            state: Mutex::new(SampleState {
                snapshot,
                sampled_at: Instant::now(),
                checks_since_sample: 0,
            }),
            counters: Arc::new(SlotCounters::default()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SampleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resample(&self, state: &mut SampleState) {
        let previous = state.snapshot.capacity;
        state.snapshot = ResourceSnapshot::compute(self.probe.sample(), &self.config);
        state.sampled_at = Instant::now();
        state.checks_since_sample = 0;
        if state.snapshot.capacity != previous {
            log::info!(
                "Capacity changed from {} to {}",
                previous,
                state.snapshot.capacity
            );
        }
    }

    /// Samples the host now regardless of cadence.
    pub fn sample_and_recompute(&self) -> ResourceSnapshot {
        let mut state = self.lock_state();
        self.resample(&mut state);
        state.snapshot
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.lock_state().snapshot
    }

    /// Capacity, refreshed if the sampling interval has passed.
    pub fn current_capacity(&self) -> usize {
        let mut state = self.lock_state();
        if state.sampled_at.elapsed() >= self.config.sample_interval() {
            self.resample(&mut state);
        }
        state.snapshot.capacity
    }

    /// Whether one more attempt may start now. The gate uses the configured
    /// per-container estimate; the request itself is enforced by the
    /// container's memory limit and only logged here.
    pub fn can_admit(&self, requested_memory: u64, requested_cpu: f64) -> bool {
        let mut state = self.lock_state();
        state.checks_since_sample += 1;
        if state.checks_since_sample >= self.config.sample_every_checks
            || state.sampled_at.elapsed() >= self.config.sample_interval()
        {
            self.resample(&mut state);
        }

        let snapshot = state.snapshot;
        let active = self.active();
        let needed =
            (self.config.per_container_memory_estimate as f64 * FREE_MEMORY_HEADROOM) as u64;
        let admit = active < snapshot.capacity && snapshot.free_memory >= needed;
        if !admit {
            log::debug!(
                "Admission refused: active {}/{}, free {} bytes, need {} bytes (request {} bytes, {} cpus)",
                active,
                snapshot.capacity,
                snapshot.free_memory,
                needed,
                requested_memory,
                requested_cpu
            );
        }
        admit
    }

    pub fn acquire(&self) -> SlotGuard {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        SlotGuard {
            counters: self.counters.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Total slots ever acquired.
    pub fn acquired(&self) -> u64 {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    /// Total slots ever released.
    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::payload::MIB;

    const GIB: u64 = 1024 * MIB;

    fn host(total_gib: u64, free_gib: u64, cpus: usize) -> HostSample {
        HostSample {
            total_memory: total_gib * GIB,
            free_memory: free_gib * GIB,
            cpus,
        }
    }

    fn controller(sample: HostSample, config: ResourcesConfig) -> (Arc<FixedProbe>, ResourceController) {
        let probe = Arc::new(FixedProbe::new(sample));
        let controller = ResourceController::new(config, probe.clone());
        (probe, controller)
    }

    #[test]
    fn test_capacity_is_min_of_limits() {
        let config = ResourcesConfig {
            max_containers: 100,
            per_container_memory_estimate: 512 * MIB,
            reserved_memory_floor: 2 * GIB,
            ..Default::default()
        };
        // 16 GiB total, 2 GiB reserved (floor < 20%) -> 28 by memory; 8 cpus * 0.75 -> 6.
        let (_, controller) = controller(host(16, 12, 8), config.clone());
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.memory_capacity, 28);
        assert_eq!(snapshot.cpu_capacity, 6);
        assert_eq!(snapshot.capacity, 6);

        // 4 GiB total, 20% reserved (below floor) -> 3.2 GiB usable -> 6 by memory.
        let (_, small) = self::controller(host(4, 2, 64), config);
        assert_eq!(small.snapshot().memory_capacity, 6);
        assert_eq!(small.snapshot().capacity, 6);
    }

    #[test]
    fn test_capacity_never_below_one() {
        let (_, controller) = controller(
            HostSample {
                total_memory: 64 * MIB,
                free_memory: 0,
                cpus: 1,
            },
            ResourcesConfig::default(),
        );
        assert_eq!(controller.snapshot().memory_capacity, 0);
        assert_eq!(controller.snapshot().cpu_capacity, 1);
        assert_eq!(controller.current_capacity(), 1);
    }

    #[test]
    fn test_admission_refused_at_capacity() {
        let config = ResourcesConfig {
            max_containers: 2,
            ..Default::default()
        };
        let (_, controller) = controller(host(32, 16, 16), config);
        assert!(controller.can_admit(0, 0.5));
        let first = controller.acquire();
        let second = controller.acquire();
        assert!(!controller.can_admit(0, 0.5));

        drop(first);
        assert!(controller.can_admit(0, 0.5));
        drop(second);
        assert_eq!(controller.active(), 0);
        assert_eq!(controller.acquired(), 2);
        assert_eq!(controller.released(), 2);
    }

    #[test]
    fn test_admission_needs_free_memory_headroom() {
        let config = ResourcesConfig {
            per_container_memory_estimate: GIB,
            ..Default::default()
        };
        let (_, controller) = controller(host(32, 1, 16), config);
        // 1 GiB free < 1.5 GiB needed.
        assert!(!controller.can_admit(0, 0.5));
    }

    #[test]
    fn test_large_request_is_gated_on_estimate_only() {
        // 3 GiB free covers 1.5 x 512 MiB even though the job asks for 4 GiB.
        let (_, controller) = controller(host(4, 3, 8), ResourcesConfig::default());
        assert_eq!(controller.snapshot().capacity, 6);
        assert!(controller.can_admit(4 * GIB, 0.5));
        assert!(controller.can_admit(64 * GIB, 2.0));
    }

    #[test]
    fn test_resample_after_n_checks() {
        let config = ResourcesConfig {
            sample_every_checks: 3,
            sample_interval_ms: 3_600_000,
            ..Default::default()
        };
        let (probe, controller) = controller(host(32, 16, 16), config);
        probe.set(host(32, 0, 16));

        // The stale sample still admits until the third check triggers a refresh.
        assert!(controller.can_admit(0, 0.5));
        assert!(controller.can_admit(0, 0.5));
        assert!(!controller.can_admit(0, 0.5));
        assert_eq!(controller.snapshot().free_memory, 0);
    }

    #[test]
    fn test_explicit_resample() {
        let (probe, controller) = controller(host(8, 4, 4), ResourcesConfig::default());
        assert_eq!(controller.snapshot().cpu_capacity, 3);
        probe.set(host(8, 4, 16));
        assert_eq!(controller.sample_and_recompute().cpu_capacity, 12);
    }
}
