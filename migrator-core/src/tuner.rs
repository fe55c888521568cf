// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Adaptive tuner (C6). Classifies the workload, derives a worker band
//! for that class, and adjusts the live worker count slow-up / fast-down
//! so a transient network spike cannot push the pool into OOM while
//! memory pressure withdraws workers immediately.

use crate::config::TunerConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadClass {
    ManySmall,
    LargeFiles,
    Mixed,
}

const SMALL_OBJECT_THRESHOLD_BYTES: u64 = 1024 * 1024;
const LARGE_OBJECT_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Classifies a workload from aggregate object-count and byte totals
/// observed so far (spec §4.6).
pub fn classify_workload(
    objects_under_1mib: u64,
    objects_total: u64,
    bytes_under_1mib: u64,
    bytes_total: u64,
    bytes_over_100mib: u64,
) -> WorkloadClass {
    if objects_total == 0 || bytes_total == 0 {
        return WorkloadClass::Mixed;
    }
    let object_fraction_small = objects_under_1mib as f64 / objects_total as f64;
    let byte_fraction_small = bytes_under_1mib as f64 / bytes_total as f64;
    if object_fraction_small >= 0.80 && byte_fraction_small >= 0.80 {
        return WorkloadClass::ManySmall;
    }
    let byte_fraction_large = bytes_over_100mib as f64 / bytes_total as f64;
    if byte_fraction_large > 0.20 {
        return WorkloadClass::LargeFiles;
    }
    WorkloadClass::Mixed
}

/// Worker band `(min, max, default)` for a workload class, derived from
/// C5's current `max_safe_workers`. There are no class-specific hard
/// caps; the memory ceiling always wins downstream in `clamp_target`.
pub fn worker_band(class: WorkloadClass, max_safe_workers: u32) -> (u32, u32, u32) {
    let max = max_safe_workers.max(1);
    match class {
        WorkloadClass::ManySmall => (1, max, max),
        WorkloadClass::LargeFiles => (1, max.min(8), max.min(4).max(1)),
        WorkloadClass::Mixed => (1, max, (max / 2).max(1)),
    }
}

struct PerformanceSample {
    at: Instant,
    speed_bytes_per_sec: f64,
    worker_count: u32,
}

/// Tracks the live worker count and the hysteresis state described in
/// spec §4.6: slow-up (bounded per adjustment), fast-down (unbounded
/// when memory requires it).
pub struct AdaptiveTuner {
    config: TunerConfig,
    current_workers: AtomicU32,
    samples: VecDeque<PerformanceSample>,
    last_adjustment: Instant,
}

impl AdaptiveTuner {
    pub fn new(config: TunerConfig, initial_workers: u32) -> Self {
        Self {
            config,
            current_workers: AtomicU32::new(initial_workers.max(1)),
            samples: VecDeque::new(),
            last_adjustment: Instant::now(),
        }
    }

    pub fn current_workers(&self) -> u32 {
        self.current_workers.load(Ordering::Relaxed)
    }

    pub fn record_performance_sample(&mut self, speed_bytes_per_sec: f64) {
        let now = Instant::now();
        self.samples.push_back(PerformanceSample {
            at: now,
            speed_bytes_per_sec,
            worker_count: self.current_workers(),
        });
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > Duration::from_secs(300) {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Immediate, unbounded downward adjustment in response to memory
    /// pressure (spec §4.5 "no hysteresis on the downside").
    pub fn force_down_to(&self, max_safe_workers: u32) {
        let target = max_safe_workers.max(1);
        let mut current = self.current_workers.load(Ordering::Relaxed);
        while current > target {
            match self.current_workers.compare_exchange_weak(
                current,
                target,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Runs the periodic adjustment loop if `adjustmentInterval` has
    /// elapsed and at least `adjustment_threshold_samples` new samples
    /// have arrived; returns the new worker count if an adjustment was
    /// made.
    pub fn maybe_adjust(
        &mut self,
        network_recommended_workers: u32,
        class: WorkloadClass,
        max_safe_workers: u32,
    ) -> Option<u32> {
        let now = Instant::now();
        if now.duration_since(self.last_adjustment) < self.config.adjustment_interval {
            return None;
        }
        if self.samples.len() < self.config.adjustment_threshold_samples {
            return None;
        }
        self.last_adjustment = now;

        let current = self.current_workers();
        let blended = ((current as f64 + network_recommended_workers as f64) / 2.0).round() as u32;

        let (band_min, band_max, _) = worker_band(class, max_safe_workers);
        let mut target = blended.clamp(band_min, band_max).min(max_safe_workers.max(1));

        if target > current {
            let max_upward_step = ((current as f64 * self.config.upward_move_percent).ceil() as u32)
                .max(self.config.upward_move_min_absolute);
            target = target.min(current + max_upward_step);
        }

        self.current_workers.store(target, Ordering::Relaxed);
        Some(target)
    }
}

/// Live-resizable concurrency limiter. `buffer_unordered`'s bound is fixed
/// at construction, so the periodic tuner adjustment grows or shrinks
/// capacity here instead, via `Semaphore::add_permits`/`forget_permits`.
/// Permits already held by in-flight transfers are never revoked; a
/// shrink only withholds capacity from the next `acquire`.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    granted: AtomicU32,
}

impl ConcurrencyGate {
    pub fn new(initial_workers: u32) -> Self {
        let initial = initial_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(initial as usize)),
            granted: AtomicU32::new(initial),
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    /// Adjusts live capacity to `target`, growing with `add_permits` or
    /// shrinking with `forget_permits`. Shrinking below the number of
    /// permits currently checked out just drains future availability;
    /// it does not cancel in-flight work.
    pub fn resize(&self, target: u32) {
        let target = target.max(1);
        let current = self.granted.swap(target, Ordering::Relaxed);
        if target > current {
            self.semaphore.add_permits((target - current) as usize);
        } else if target < current {
            self.semaphore.forget_permits((current - target) as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use test_r::test;

    fn config() -> TunerConfig {
        TunerConfig {
            adjustment_interval: Duration::from_secs(0),
            adjustment_threshold_samples: 1,
            upward_move_percent: 0.25,
            upward_move_min_absolute: 2,
        }
    }

    #[test]
    fn classifies_many_small_workload() {
        let class = classify_workload(90, 100, 90_000_000, 100_000_000, 0);
        assert_eq!(class, WorkloadClass::ManySmall);
    }

    #[test]
    fn classifies_large_files_workload() {
        let class = classify_workload(10, 100, 5_000_000, 1_000_000_000, 300_000_000);
        assert_eq!(class, WorkloadClass::LargeFiles);
    }

    #[test]
    fn upward_moves_are_bounded_per_adjustment() {
        let mut tuner = AdaptiveTuner::new(config(), 4);
        tuner.record_performance_sample(1.0);
        // network recommends a huge jump; upward step is capped at
        // max(25% of 4, 2) = 2, so target should not exceed 6.
        let adjusted = tuner.maybe_adjust(100, WorkloadClass::Mixed, 1000).unwrap();
        assert!(adjusted <= 6);
    }

    #[test]
    fn force_down_is_immediate_and_unbounded() {
        let tuner = AdaptiveTuner::new(config(), 50);
        tuner.force_down_to(3);
        assert_eq!(tuner.current_workers(), 3);
    }

    #[test]
    fn memory_cap_wins_over_network_recommendation() {
        let mut tuner = AdaptiveTuner::new(config(), 4);
        tuner.record_performance_sample(1.0);
        let adjusted = tuner.maybe_adjust(100, WorkloadClass::Mixed, 5).unwrap();
        assert!(adjusted <= 5);
    }

    #[test]
    async fn gate_grows_capacity_without_disturbing_held_permits() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.unwrap();
        gate.resize(3);
        let second = gate.acquire().await.unwrap();
        let third = gate.acquire().await.unwrap();
        assert!(gate.acquire().now_or_never().is_none());
        drop((held, second, third));
    }

    #[test]
    async fn gate_shrink_withholds_future_capacity() {
        let gate = ConcurrencyGate::new(3);
        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        gate.resize(1);
        drop(a);
        drop(b);
        assert!(gate.acquire().now_or_never().is_some());
        assert!(gate.acquire().now_or_never().is_none());
    }
}
